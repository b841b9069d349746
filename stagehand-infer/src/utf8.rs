/// Reassembles per-token byte fragments into valid UTF-8.
///
/// Byte-fallback tokens can split one character across several tokens; the bytes of an
/// unfinished character are held back until the token that completes it.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    pending: Vec<u8>,
}

impl FragmentAssembler {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to is a char boundary, so this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // truncated at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left, replacing an unfinished character.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut asm = FragmentAssembler::default();
        assert_eq!(asm.push(b" once"), " once");
        assert!(!asm.has_pending());
    }

    #[test]
    fn split_character_waits() {
        let mut asm = FragmentAssembler::default();
        assert_eq!(asm.push(&[0xE2]), "");
        assert_eq!(asm.push(&[0x82]), "");
        assert!(asm.has_pending());
        assert_eq!(asm.push(&[0xAC, b'!']), "€!");
        assert!(!asm.has_pending());
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut asm = FragmentAssembler::default();
        assert_eq!(asm.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn finish_flushes_incomplete_tail() {
        let mut asm = FragmentAssembler::default();
        assert_eq!(asm.push(&[b'x', 0xF0, 0x9F]), "x");
        assert_eq!(asm.finish(), "\u{FFFD}");
        assert_eq!(asm.finish(), "");
    }
}
