/// Incremental UTF-8 decoder that survives characters split across reads.
///
/// Bytes belonging to an unfinished character stay buffered until the next
/// call, so one decoder must live for the whole body of a single response.
/// Invalid sequences become U+FFFD instead of failing the stream.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut decoded = String::with_capacity(self.pending.len());
        let mut cursor = 0;

        while cursor < self.pending.len() {
            match std::str::from_utf8(&self.pending[cursor..]) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    cursor = self.pending.len();
                }
                Err(error) => {
                    let valid_end = cursor + error.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[cursor..valid_end]));

                    match error.error_len() {
                        Some(invalid_len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            cursor = valid_end + invalid_len;
                        }
                        None => {
                            // Truncated tail: keep it for the next read.
                            cursor = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..cursor);
        decoded
    }

    /// Flushes the decoder at end of data. A dangling partial character becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }

        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn multi_byte_characters_split_at_every_boundary_decode_intact() {
        let text = "héllo wörld ✓ 🦀 done";
        let bytes = text.as_bytes();

        for split in 0..=bytes.len() {
            let mut decoder = Utf8ChunkDecoder::new();
            let mut decoded = decoder.decode(&bytes[..split]);
            decoded.push_str(&decoder.decode(&bytes[split..]));
            decoded.push_str(&decoder.finish());
            assert_eq!(decoded, text, "split at byte {split}");
        }
    }

    #[test]
    fn byte_at_a_time_feeding_matches_whole_input() {
        let text = "日本語のテキスト 🦀";
        let mut decoder = Utf8ChunkDecoder::new();

        let decoded = text
            .as_bytes()
            .iter()
            .map(|byte| decoder.decode(std::slice::from_ref(byte)))
            .collect::<String>();

        assert_eq!(decoded, text);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn partial_character_is_held_back_until_completed() {
        let crab = "🦀".as_bytes();
        let mut decoder = Utf8ChunkDecoder::new();

        assert_eq!(decoder.decode(&crab[..2]), "");
        assert_eq!(decoder.pending_len(), 2);
        assert_eq!(decoder.decode(&crab[2..]), "🦀");
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn invalid_bytes_are_replaced_without_stalling() {
        let mut decoder = Utf8ChunkDecoder::new();

        assert_eq!(decoder.decode(b"ok\xFFthen"), "ok\u{FFFD}then");
        assert_eq!(decoder.decode(b"\xC3\x28"), "\u{FFFD}(");
    }

    #[test]
    fn finish_flushes_truncated_tail_as_replacement() {
        let mut decoder = Utf8ChunkDecoder::new();

        assert_eq!(decoder.decode(b"end\xE2\x9C"), "end");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.finish(), "");
    }
}
