//! Incremental UTF-8 decoding of PTY output chunks

/// Decodes a byte stream into text chunk by chunk.
///
/// A multibyte sequence split across two reads is held back until the rest
/// arrives; genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    carry: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk of bytes.
    pub fn decode(&mut self, data: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(data);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;

        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            // Incomplete sequence at the end of the chunk
                            self.carry = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is still held back.
    pub fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut stream = Utf8Stream::new();
        assert_eq!(stream.decode(b"\x1b[32mok\x1b[0m\r\n"), "\x1b[32mok\x1b[0m\r\n");
    }

    #[test]
    fn split_sequence_is_carried() {
        let mut stream = Utf8Stream::new();
        let bytes = "→x".as_bytes();
        assert_eq!(stream.decode(&bytes[..1]), "");
        assert_eq!(stream.decode(&bytes[1..]), "→x");
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut stream = Utf8Stream::new();
        assert_eq!(stream.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn finish_flushes_dangling_bytes() {
        let mut stream = Utf8Stream::new();
        assert_eq!(stream.decode(&[0xe2, 0x86]), "");
        assert_eq!(stream.finish(), "\u{FFFD}");
    }
}
