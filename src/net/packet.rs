use crate::world::position::Position;

/// Little-endian cursor over a node payload or message body.
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

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        if self.remaining() < 1 {
            return None;
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Some(value)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        let lo = self.data[self.pos] as u16;
        let hi = self.data[self.pos + 1] as u16;
        self.pos += 2;
        Some(lo | (hi << 8))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        if self.remaining() < 4 {
            return None;
        }
        let b0 = self.data[self.pos] as u32;
        let b1 = self.data[self.pos + 1] as u32;
        let b2 = self.data[self.pos + 2] as u32;
        let b3 = self.data[self.pos + 3] as u32;
        self.pos += 4;
        Some(b0 | (b1 << 8) | (b2 << 16) | (b3 << 24))
    }

    pub fn read_i32_le(&mut self) -> Option<i32> {
        self.read_u32_le().map(|value| value as i32)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        if self.remaining() < 8 {
            return None;
        }
        let low = self.read_u32_le()? as u64;
        let high = self.read_u32_le()? as u64;
        Some(low | (high << 32))
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        self.read_u8().map(|value| value != 0)
    }

    /// u16 length, or 0xffff followed by a u32 length for long strings.
    pub fn read_len_prefixed(&mut self) -> Option<usize> {
        let len = self.read_u16_le()? as usize;
        if len == 0xffff {
            let long_len = self.read_u32_le()? as usize;
            return Some(long_len);
        }
        Some(len)
    }

    pub fn read_string_lossy(&mut self) -> Option<String> {
        let len = self.read_len_prefixed()?;
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// u32-length byte block, used for embedded encoded maps.
    pub fn read_blob(&mut self) -> Option<&'a [u8]> {
        let len = self.read_u32_le()? as usize;
        self.read_bytes(len)
    }

    pub fn read_position(&mut self) -> Option<Position> {
        if self.remaining() < 5 {
            return None;
        }
        let x = self.read_u16_le()?;
        let y = self.read_u16_le()?;
        let z = self.read_u8()?;
        Some(Position::new(x, y, z))
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let start = self.pos;
        self.pos += len;
        Some(&self.data[start..start + len])
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

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.data.push((value & 0xff) as u8);
        self.data.push((value >> 8) as u8);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.data.push((value & 0xff) as u8);
        self.data.push(((value >> 8) & 0xff) as u8);
        self.data.push(((value >> 16) & 0xff) as u8);
        self.data.push(((value >> 24) & 0xff) as u8);
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.write_u32_le(value as u32);
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.write_u32_le((value & 0xffff_ffff) as u32);
        self.write_u32_le((value >> 32) as u32);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    pub fn write_len_prefixed(&mut self, len: usize) {
        if len > 0xfffe {
            self.write_u16_le(0xffff);
            self.write_u32_le(len as u32);
        } else {
            self.write_u16_le(len as u16);
        }
    }

    pub fn write_string(&mut self, bytes: &[u8]) {
        self.write_len_prefixed(bytes.len());
        self.write_bytes(bytes);
    }

    pub fn write_string_str(&mut self, value: &str) {
        self.write_string(value.as_bytes());
    }

    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_u32_le(bytes.len() as u32);
        self.write_bytes(bytes);
    }

    pub fn write_position(&mut self, position: Position) {
        self.write_u16_le(position.x);
        self.write_u16_le(position.y);
        self.write_u8(position.z);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg_next(state: &mut u64) -> u32 {
        *state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (*state >> 32) as u32
    }

    #[test]
    fn string_roundtrip_varied_lengths() {
        let mut state = 0x1234_5678_9abc_def0;
        for _ in 0..128 {
            let len = (lcg_next(&mut state) % 1024) as usize;
            let text: String = (0..len)
                .map(|_| char::from(b'a' + (lcg_next(&mut state) % 26) as u8))
                .collect();
            let mut writer = PacketWriter::new();
            writer.write_string_str(&text);
            let mut reader = PacketReader::new(writer.as_slice());
            assert_eq!(reader.read_string_lossy().as_deref(), Some(text.as_str()));
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn long_len_prefix_roundtrip() {
        let len = 0xffff + 5;
        let bytes = vec![0x7f; len];
        let mut writer = PacketWriter::new();
        writer.write_string(&bytes);
        let mut reader = PacketReader::new(writer.as_slice());
        let decoded = reader.read_string_lossy().expect("string");
        assert_eq!(decoded.len(), len);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn short_reads_leave_cursor_alone() {
        let mut writer = PacketWriter::new();
        writer.write_u16_le(7);
        writer.write_u8(1);
        let mut reader = PacketReader::new(writer.as_slice());
        assert_eq!(reader.read_u32_le(), None);
        assert_eq!(reader.read_position(), None);
        assert_eq!(reader.read_u16_le(), Some(7));
        assert_eq!(reader.read_blob(), None);
        assert_eq!(reader.read_u8(), Some(1));
    }

    #[test]
    fn signed_and_position_fields() {
        let mut writer = PacketWriter::new();
        writer.write_i32_le(-42);
        writer.write_position(Position::new(65000, 3, 15));
        writer.write_blob(b"map");
        let mut reader = PacketReader::new(writer.as_slice());
        assert_eq!(reader.read_i32_le(), Some(-42));
        assert_eq!(reader.read_position(), Some(Position::new(65000, 3, 15)));
        assert_eq!(reader.read_blob(), Some(&b"map"[..]));
        assert!(reader.is_empty());
    }
}
