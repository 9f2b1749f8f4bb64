use crate::{byte_reader::ByteReader, byte_writer::ByteWriter, error::SerdeErr};

/// A type that can be written to and read from the replica wire format
pub trait Serde: Sized + Clone + PartialEq {
    /// Serialize into the writer
    fn ser(&self, writer: &mut ByteWriter);

    /// Parse from the reader
    fn de(reader: &mut ByteReader) -> Result<Self, SerdeErr>;

    /// Number of bytes `ser` will write
    fn byte_length(&self) -> usize;
}
