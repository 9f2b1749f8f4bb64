use crate::{byte_reader::ByteReader, byte_writer::ByteWriter, error::SerdeErr, serde::Serde};

const MAX_BYTES: usize = 10;

/// Length prefix for variable-size payloads
pub type PackedSize = UnsignedVariableInteger;

/// An unsigned integer written in as few bytes as its value allows: seven
/// value bits per byte, least significant group first, with the high bit
/// set on every byte but the last.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct UnsignedVariableInteger {
    value: u64,
}

impl UnsignedVariableInteger {
    pub fn new<T: Into<u64>>(value: T) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn get(&self) -> u64 {
        self.value
    }

    pub fn set<T: Into<u64>>(&mut self, value: T) {
        self.value = value.into();
    }

    /// Convert into a narrower integer
    ///
    /// # Panics
    ///
    /// Panics if the value does not fit; use `try_to` on untrusted input
    pub fn to<T: TryFrom<u64>>(&self) -> T {
        let Ok(t_value) = T::try_from(self.value) else {
            panic!("UnsignedVariableInteger's value is out of range to convert to this type.");
        };
        t_value
    }

    pub fn try_to<T: TryFrom<u64>>(&self) -> Result<T, SerdeErr> {
        T::try_from(self.value).map_err(|_| SerdeErr::InvalidValue {
            type_name: std::any::type_name::<T>(),
            value: self.value,
        })
    }
}

impl From<u32> for UnsignedVariableInteger {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<usize> for UnsignedVariableInteger {
    fn from(value: usize) -> Self {
        Self::new(value as u64)
    }
}

impl Serde for UnsignedVariableInteger {
    fn ser(&self, writer: &mut ByteWriter) {
        let mut value = self.value;
        loop {
            let group = (value & 0x7F) as u8;
            value >>= 7;
            let proceed = value != 0;
            if proceed {
                writer.write_byte(group | 0x80);
            } else {
                writer.write_byte(group);
                return;
            }
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, SerdeErr> {
        let mut output: u64 = 0;
        for index in 0..MAX_BYTES {
            let byte = reader.read_byte()?;
            let group = u64::from(byte & 0x7F);
            let shift = 7 * index as u32;
            if shift == 63 && group > 1 {
                return Err(SerdeErr::IntegerOverflow { bytes: index + 1 });
            }
            output |= group << shift;
            if byte & 0x80 == 0 {
                return Ok(Self { value: output });
            }
        }
        Err(SerdeErr::IntegerOverflow { bytes: MAX_BYTES })
    }

    fn byte_length(&self) -> usize {
        let mut value = self.value >> 7;
        let mut output = 1;
        while value != 0 {
            value >>= 7;
            output += 1;
        }
        output
    }
}
