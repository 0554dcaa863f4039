/// Leftover of a received frame which did not fit into the caller's read buffer.
pub struct ReadBuffer {
    read_buffer: Vec<u8>,
    start_pos: usize,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::new(),
            start_pos: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start_pos >= self.read_buffer.len()
    }

    pub fn replace(&mut self, payload: Vec<u8>) {
        self.read_buffer = payload;
        self.start_pos = 0;
    }

    pub fn write_to_buffer(&mut self, out: &mut [u8]) -> usize {
        let available_to_write = self.read_buffer.len() - self.start_pos;

        if available_to_write == 0 {
            return 0;
        }

        let to_write_size = available_to_write.min(out.len());

        out[..to_write_size]
            .copy_from_slice(&self.read_buffer[self.start_pos..self.start_pos + to_write_size]);

        self.start_pos += to_write_size;

        if self.start_pos == self.read_buffer.len() {
            self.read_buffer.clear();
            self.start_pos = 0;
        }

        to_write_size
    }
}

#[cfg(test)]
mod tests {
    use super::ReadBuffer;

    #[test]
    fn test_drains_in_small_pieces() {
        let mut buffer = ReadBuffer::new();
        assert!(buffer.is_empty());

        buffer.replace(b"abcdefg".to_vec());

        let mut out = [0u8; 3];
        assert_eq!(3, buffer.write_to_buffer(&mut out));
        assert_eq!(b"abc", &out);

        assert_eq!(3, buffer.write_to_buffer(&mut out));
        assert_eq!(b"def", &out);

        assert_eq!(1, buffer.write_to_buffer(&mut out));
        assert_eq!(b'g', out[0]);

        assert!(buffer.is_empty());
        assert_eq!(0, buffer.write_to_buffer(&mut out));
    }
}
