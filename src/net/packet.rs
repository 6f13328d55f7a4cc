/// Number of bytes used by the count prefix of a variable-length field with
/// the given declared maximum: the smallest width such that every count in
/// `0..=max_len` fits. A 254-byte field uses one byte, a 1024-byte field two.
pub fn count_width(max_len: usize) -> usize {
    let mut width = 1;
    let mut ceiling = 256usize;
    while ceiling < max_len + 1 {
        width += 1;
        ceiling *= 256;
    }
    width
}

/// Truncates at a character boundary so the result stays valid UTF-8 and
/// occupies at most `max_bytes` bytes.
pub fn truncate_to_bytes(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        if self.remaining() < 1 {
            return None;
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Some(value)
    }

    pub fn read_i32_le(&mut self) -> Option<i32> {
        if self.remaining() < 4 {
            return None;
        }
        let b0 = self.data[self.pos] as u32;
        let b1 = self.data[self.pos + 1] as u32;
        let b2 = self.data[self.pos + 2] as u32;
        let b3 = self.data[self.pos + 3] as u32;
        self.pos += 4;
        Some((b0 | (b1 << 8) | (b2 << 16) | (b3 << 24)) as i32)
    }

    pub fn read_f64_le(&mut self) -> Option<f64> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Some(f64::from_le_bytes(raw))
    }

    /// Reads a little-endian count prefix of `width` bytes.
    pub fn read_count(&mut self, width: usize) -> Option<usize> {
        let mut count = 0usize;
        for shift in 0..width {
            let byte = self.read_u8()? as usize;
            count |= byte << (8 * shift);
        }
        Some(count)
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let start = self.pos;
        self.pos += len;
        Some(&self.data[start..start + len])
    }

    pub fn skip(&mut self, len: usize) -> Option<()> {
        if self.remaining() < len {
            return None;
        }
        self.pos += len;
        Some(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    data: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_i32_le(&mut self, value: i32) {
        let raw = value as u32;
        self.data.push((raw & 0xff) as u8);
        self.data.push(((raw >> 8) & 0xff) as u8);
        self.data.push(((raw >> 16) & 0xff) as u8);
        self.data.push(((raw >> 24) & 0xff) as u8);
    }

    pub fn write_f64_le(&mut self, value: f64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_count(&mut self, count: usize, width: usize) {
        for shift in 0..width {
            self.data.push(((count >> (8 * shift)) & 0xff) as u8);
        }
    }

    /// Writes a string field declared with the given maximum length: a count
    /// prefix sized by [`count_width`] followed by the bytes. Over-long
    /// values are truncated at a character boundary.
    pub fn write_string_bounded(&mut self, value: &str, max_len: usize) {
        let kept = truncate_to_bytes(value, max_len);
        self.write_count(kept.len(), count_width(max_len));
        self.data.extend_from_slice(kept.as_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}
