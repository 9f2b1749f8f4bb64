mod byte_reader;
mod byte_writer;
mod error;
mod impls;
mod integer;
mod serde;

pub use byte_reader::ByteReader;
pub use byte_writer::{ByteWriter, Marker};
pub use error::SerdeErr;
pub use integer::{PackedSize, UnsignedVariableInteger};
pub use serde::Serde;
