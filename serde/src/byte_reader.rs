use crate::error::SerdeErr;

/// Reads bytes sequentially out of a borrowed slice
#[derive(Clone)]
pub struct ByteReader<'b> {
    buffer: &'b [u8],
    position: usize,
}

impl<'b> ByteReader<'b> {
    pub fn new(buffer: &'b [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn read_byte(&mut self) -> Result<u8, SerdeErr> {
        let byte = *self
            .buffer
            .get(self.position)
            .ok_or(SerdeErr::UnexpectedEnd {
                needed: 1,
                remaining: 0,
            })?;
        self.position += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'b [u8], SerdeErr> {
        let remaining = self.remaining();
        if count > remaining {
            return Err(SerdeErr::UnexpectedEnd {
                needed: count,
                remaining,
            });
        }
        let start = self.position;
        self.position += count;
        Ok(&self.buffer[start..self.position])
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], SerdeErr> {
        let bytes = self.read_bytes(N)?;
        let mut output = [0; N];
        output.copy_from_slice(bytes);
        Ok(output)
    }

    /// Split off the next `count` bytes as an independent reader. The
    /// outer reader continues after them whether or not the inner one is
    /// fully consumed.
    pub fn sub_reader(&mut self, count: usize) -> Result<ByteReader<'b>, SerdeErr> {
        Ok(ByteReader::new(self.read_bytes(count)?))
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn remaining_slice(&self) -> &'b [u8] {
        &self.buffer[self.position..]
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
