/// Position of a fixed-width slot reserved in a `ByteWriter`, to be filled
/// in later with `ByteWriter::patch_u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    offset: usize,
}

impl Marker {
    /// Index of the first byte after the reserved slot
    pub fn end(&self) -> usize {
        self.offset + 4
    }
}

/// A growable byte buffer. Unlike an MTU-bounded writer it never refuses a
/// write; callers decide how much to put in a single send.
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        self.buffer.push(byte);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Reserve four bytes at the current position
    pub fn insert_marker(&mut self) -> Marker {
        let offset = self.buffer.len();
        self.buffer.extend_from_slice(&[0; 4]);
        Marker { offset }
    }

    /// Fill a previously reserved slot
    ///
    /// # Panics
    ///
    /// Panics if the marker does not belong to this buffer's current contents
    pub fn patch_u32(&mut self, marker: Marker, value: u32) {
        if marker.end() > self.buffer.len() {
            panic!(
                "Marker at offset {} is past the end of a {} byte buffer",
                marker.offset,
                self.buffer.len()
            );
        }
        self.buffer[marker.offset..marker.end()].copy_from_slice(&value.to_le_bytes());
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop all contents, keeping the allocation
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}
