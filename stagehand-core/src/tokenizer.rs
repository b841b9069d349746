use crate::error::{Result, StagehandError};
use std::borrow::Cow;
use std::path::Path;
use std::time::Instant;

/// Placeholder piece for records missing from a short vocabulary file.
pub const PAD_PIECE: &[u8] = b"<pad>";

/// Ids 0..3 are `<unk>`, `<s>`, `</s>`; raw byte `b` lives at `b + 3`.
pub const BYTE_FALLBACK_OFFSET: u32 = 3;

const MAX_VOCAB_SIZE: usize = 10_000_000;
const MAX_PIECE_LEN: usize = 1024 * 1024;

/// Bounds-checked little-endian reader over the vocabulary bytes.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(StagehandError::VocabularyLoad(format!(
                "unexpected EOF at offset {}: need {n} bytes, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_i32(&mut self) -> Result<i32> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f32(&mut self) -> Result<f32> {
        let b = self.read_bytes(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn non_negative(value: i32, field: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| StagehandError::VocabularyLoad(format!("{field} is negative: {value}")))
}

#[inline]
fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// `<0xHH>` pieces stand for the raw byte `HH`.
fn parse_byte_piece(piece: &[u8]) -> Option<u8> {
    if piece.len() == 6 && piece.starts_with(b"<0x") && piece[5] == b'>' {
        let hex = std::str::from_utf8(&piece[3..5]).ok()?;
        u8::from_str_radix(hex, 16).ok()
    } else {
        None
    }
}

/// Byte-level BPE tokenizer with byte fallback, driven by per-piece merge scores.
///
/// A default-constructed tokenizer is empty (vocab size 0) until [`Tokenizer::load`]
/// succeeds.
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    pieces: Vec<Vec<u8>>,
    scores: Vec<f32>,
    // piece ids ordered by piece bytes, for binary search
    sorted: Vec<u32>,
    bos_id: u32,
    eos_id: u32,
    max_piece_len: usize,
}

impl Tokenizer {
    /// Load a vocabulary file into this tokenizer.
    /// On failure the tokenizer keeps its previous contents.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        *self = Self::from_file(path)?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let start = Instant::now();
        let mapped = crate::mmap::map_file(path).map_err(|e| {
            StagehandError::VocabularyLoad(format!("{}: {e}", path.display()))
        })?;
        let tok = Self::from_bytes(mapped.as_ref())?;
        tracing::info!(
            vocab_size = tok.vocab_size(),
            bos = tok.bos_id,
            eos = tok.eos_id,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "vocabulary loaded"
        );
        Ok(tok)
    }

    /// Parse the binary vocabulary layout:
    /// `[i32 vocab_size, i32 bos, i32 eos, i32 max_piece_len]` then per record
    /// `{f32 score, i32 len, len bytes}`. Records cut off before their score become `<pad>`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let vocab_size = non_negative(cur.read_i32()?, "vocab_size")?;
        let bos_id = non_negative(cur.read_i32()?, "bos_id")? as u32;
        let eos_id = non_negative(cur.read_i32()?, "eos_id")? as u32;
        let max_piece_len = non_negative(cur.read_i32()?, "max_piece_len")?;

        if vocab_size > MAX_VOCAB_SIZE {
            return Err(StagehandError::VocabularyLoad(format!(
                "vocab_size {vocab_size} exceeds limit {MAX_VOCAB_SIZE}"
            )));
        }

        let mut pieces = Vec::with_capacity(vocab_size);
        let mut scores = Vec::with_capacity(vocab_size);
        let mut padded = 0usize;

        for i in 0..vocab_size {
            let Ok(score) = cur.read_f32() else {
                pieces.push(PAD_PIECE.to_vec());
                scores.push(0.0);
                padded += 1;
                continue;
            };
            let len = non_negative(cur.read_i32()?, "piece length")?;
            if len > MAX_PIECE_LEN {
                return Err(StagehandError::VocabularyLoad(format!(
                    "piece {i} length {len} exceeds limit {MAX_PIECE_LEN}"
                )));
            }
            pieces.push(cur.read_bytes(len)?.to_vec());
            scores.push(score);
        }

        if padded > 0 {
            tracing::debug!(padded, "vocabulary shorter than declared, padded");
        }
        if bos_id as usize >= vocab_size || eos_id as usize >= vocab_size {
            tracing::warn!(bos_id, eos_id, vocab_size, "special token id outside vocabulary");
        }

        Ok(Self::build(pieces, scores, bos_id, eos_id, max_piece_len))
    }

    /// Build a tokenizer directly from `(piece, score)` pairs, id = index.
    pub fn from_pieces(pieces: Vec<(Vec<u8>, f32)>, bos_id: u32, eos_id: u32) -> Self {
        let max_piece_len = pieces.iter().map(|(p, _)| p.len()).max().unwrap_or(0);
        let (pieces, scores) = pieces.into_iter().unzip();
        Self::build(pieces, scores, bos_id, eos_id, max_piece_len)
    }

    fn build(
        pieces: Vec<Vec<u8>>,
        scores: Vec<f32>,
        bos_id: u32,
        eos_id: u32,
        max_piece_len: usize,
    ) -> Self {
        let mut sorted: Vec<u32> = (0..pieces.len() as u32).collect();
        // stable, so duplicate pieces resolve to the lowest id
        sorted.sort_by(|&a, &b| pieces[a as usize].cmp(&pieces[b as usize]));
        Self {
            pieces,
            scores,
            sorted,
            bos_id,
            eos_id,
            max_piece_len,
        }
    }

    /// Serialize back into the on-disk vocabulary layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body: usize = self.pieces.iter().map(|p| 8 + p.len()).sum();
        let mut out = Vec::with_capacity(16 + body);
        for field in [
            self.pieces.len() as i32,
            self.bos_id as i32,
            self.eos_id as i32,
            self.max_piece_len as i32,
        ] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for (piece, score) in self.pieces.iter().zip(&self.scores) {
            out.extend_from_slice(&score.to_le_bytes());
            out.extend_from_slice(&(piece.len() as i32).to_le_bytes());
            out.extend_from_slice(piece);
        }
        out
    }

    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn max_piece_len(&self) -> usize {
        self.max_piece_len
    }

    pub fn piece(&self, id: u32) -> Option<&[u8]> {
        self.pieces.get(id as usize).map(Vec::as_slice)
    }

    pub fn score(&self, id: u32) -> Option<f32> {
        self.scores.get(id as usize).copied()
    }

    /// Exact piece lookup in O(log n).
    pub fn lookup(&self, text: &[u8]) -> Option<u32> {
        let idx = self
            .sorted
            .partition_point(|&i| self.pieces[i as usize].as_slice() < text);
        let &id = self.sorted.get(idx)?;
        (self.pieces[id as usize] == text).then_some(id)
    }

    pub fn decode_verify(&self, id: u32) -> bool {
        (id as usize) < self.vocab_size()
    }

    pub fn encode(&self, text: &str, num_bos: usize, num_eos: usize) -> Vec<u32> {
        self.encode_bytes(text.as_bytes(), num_bos, num_eos)
    }

    /// Encode raw bytes. Input that is not valid UTF-8 still encodes, through byte fallback.
    pub fn encode_bytes(&self, input: &[u8], num_bos: usize, num_eos: usize) -> Vec<u32> {
        if input.is_empty() && num_bos == 0 && num_eos == 0 {
            return Vec::new();
        }

        let mut tokens = Vec::with_capacity(num_bos + input.len() + num_eos);
        tokens.extend(std::iter::repeat_n(self.bos_id, num_bos));

        // one code point at a time: a lead/ASCII byte starts a new buffer,
        // continuation bytes extend it up to 4 bytes
        let mut buf: Vec<u8> = Vec::with_capacity(4);
        for (i, &byte) in input.iter().enumerate() {
            if !is_continuation(byte) {
                buf.clear();
            }
            buf.push(byte);

            let next_continues = input.get(i + 1).is_some_and(|&b| is_continuation(b));
            if next_continues && buf.len() < 4 {
                continue;
            }

            match self.lookup(&buf) {
                Some(id) => tokens.push(id),
                None => tokens.extend(buf.iter().map(|&b| b as u32 + BYTE_FALLBACK_OFFSET)),
            }
            buf.clear();
        }

        self.merge_pairs(&mut tokens);

        tokens.extend(std::iter::repeat_n(self.eos_id, num_eos));
        tokens
    }

    // merge the best-scoring adjacent pair until nothing merges; first occurrence wins ties
    fn merge_pairs(&self, tokens: &mut Vec<u32>) {
        let mut merged = Vec::with_capacity(self.max_piece_len.max(8) * 2);
        loop {
            // -inf and NaN scores never clear the floor, so those pieces never merge
            let mut best_score = f32::MIN;
            let mut best: Option<(u32, usize)> = None;
            for i in 0..tokens.len().saturating_sub(1) {
                let (Some(a), Some(b)) = (self.piece(tokens[i]), self.piece(tokens[i + 1])) else {
                    continue;
                };
                merged.clear();
                merged.extend_from_slice(a);
                merged.extend_from_slice(b);
                if let Some(id) = self.lookup(&merged) {
                    let score = self.scores[id as usize];
                    if score > best_score {
                        best_score = score;
                        best = Some((id, i));
                    }
                }
            }

            let Some((id, idx)) = best else {
                break;
            };
            tokens[idx] = id;
            tokens.remove(idx + 1);
        }
    }

    /// Bytes for `id`, given the token that preceded it.
    ///
    /// Empty when `id` is outside the vocabulary. After BOS a leading space is dropped,
    /// and `<0xHH>` pieces come back as the single byte `HH`.
    pub fn decode(&self, prev_id: u32, id: u32) -> Cow<'_, [u8]> {
        let Some(mut piece) = self.piece(id) else {
            return Cow::Borrowed(&[]);
        };
        if prev_id == self.bos_id && piece.first() == Some(&b' ') {
            piece = &piece[1..];
        }
        match parse_byte_piece(piece) {
            Some(byte) => Cow::Owned(vec![byte]),
            None => Cow::Borrowed(piece),
        }
    }

    /// Decode a whole id sequence, skipping BOS and stopping at the first EOS.
    pub fn decode_all(&self, tokens: &[u32]) -> String {
        let mut bytes = Vec::new();
        let mut prev = self.bos_id;
        for &id in tokens {
            if id == self.eos_id {
                break;
            }
            if id != self.bos_id {
                bytes.extend_from_slice(&self.decode(prev, id));
            }
            prev = id;
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// `<unk> <s> </s>`, 256 byte pieces, then characters and a handful of merges.
    fn story_vocab() -> Tokenizer {
        let mut pieces: Vec<(Vec<u8>, f32)> = vec![
            (b"<unk>".to_vec(), 0.0),
            (b"<s>".to_vec(), 0.0),
            (b"</s>".to_vec(), 0.0),
        ];
        for b in 0..=255u8 {
            pieces.push((format!("<0x{b:02X}>").into_bytes(), 0.0));
        }
        let chars = [" ", "o", "n", "c", "e", "u", "p", "a", "t", "i", "m", "é"];
        for c in chars {
            pieces.push((c.as_bytes().to_vec(), -10.0));
        }
        let merges = [
            ("on", -1.0),
            ("ce", -2.0),
            ("once", -0.5),
            (" u", -3.0),
            ("up", -4.0),
            (" up", -2.5),
            (" upon", -0.8),
            (" a", -1.5),
            (" t", -3.5),
            ("im", -3.0),
            ("ime", -2.0),
            (" time", -0.9),
        ];
        for (m, s) in merges {
            pieces.push((m.as_bytes().to_vec(), s));
        }
        Tokenizer::from_pieces(pieces, 1, 2)
    }

    fn id(tok: &Tokenizer, piece: &str) -> u32 {
        tok.lookup(piece.as_bytes()).unwrap()
    }

    #[test]
    fn lookup_finds_every_piece() {
        let tok = story_vocab();
        for i in 0..tok.vocab_size() as u32 {
            let piece = tok.piece(i).unwrap().to_vec();
            assert_eq!(tok.lookup(&piece), Some(i));
        }
        assert_eq!(tok.lookup(b"zzz"), None);
        assert_eq!(tok.lookup(b""), None);
    }

    #[test]
    fn encode_merges_by_score() {
        let tok = story_vocab();
        let ids = tok.encode("once upon a time", 0, 0);
        let expected: Vec<u32> = ["once", " upon", " a", " time"]
            .iter()
            .map(|p| id(&tok, p))
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn encode_wraps_with_bos_and_eos() {
        let tok = story_vocab();
        let ids = tok.encode("once", 2, 1);
        assert_eq!(ids, vec![1, 1, id(&tok, "once"), 2]);
    }

    #[test]
    fn encode_empty() {
        let tok = story_vocab();
        assert!(tok.encode("", 0, 0).is_empty());
        assert_eq!(tok.encode("", 1, 1), vec![1, 2]);
    }

    #[test]
    fn ties_go_to_first_pair() {
        // "ab" and "bc" share a score; "abc" has no merge path from "a"+"bc"
        let pieces = vec![
            (b"<unk>".to_vec(), 0.0),
            (b"<s>".to_vec(), 0.0),
            (b"</s>".to_vec(), 0.0),
            (b"a".to_vec(), 0.0),
            (b"b".to_vec(), 0.0),
            (b"c".to_vec(), 0.0),
            (b"ab".to_vec(), 1.0),
            (b"bc".to_vec(), 1.0),
        ];
        let tok = Tokenizer::from_pieces(pieces, 1, 2);
        assert_eq!(tok.encode("abc", 0, 0), vec![6, 5]);
    }

    #[test]
    fn byte_fallback_for_unknown_codepoint() {
        let tok = story_vocab();
        // '€' is E2 82 AC and has no piece
        let ids = tok.encode("€", 0, 0);
        assert_eq!(ids, vec![0xE2 + 3, 0x82 + 3, 0xAC + 3]);
        // 'é' is a known two-byte piece
        assert_eq!(tok.encode("é", 0, 0), vec![id(&tok, "é")]);
    }

    #[test]
    fn byte_fallback_covers_every_byte() {
        let tok = story_vocab();
        let input: Vec<u8> = (0..=255u8).rev().collect();
        let ids = tok.encode_bytes(&input, 0, 0);
        let mut rebuilt = Vec::new();
        let mut prev = 0;
        for &t in &ids {
            assert!(tok.decode_verify(t));
            rebuilt.extend_from_slice(&tok.decode(prev, t));
            prev = t;
        }
        assert_eq!(rebuilt, input);
    }

    #[test]
    fn round_trip_recovers_raw_byte() {
        let tok = story_vocab();
        let input = "once upon a time \u{1}";
        let ids = tok.encode(input, 1, 1);
        assert_eq!(*ids.last().unwrap(), tok.eos_id());
        assert!(ids.contains(&(0x01 + BYTE_FALLBACK_OFFSET)));

        let mut out = Vec::new();
        for w in ids.windows(2) {
            if w[1] == tok.eos_id() {
                break;
            }
            out.extend_from_slice(&tok.decode(w[0], w[1]));
        }
        assert_eq!(String::from_utf8(out).unwrap(), input);
        assert_eq!(tok.decode_all(&ids), input);
    }

    #[test]
    fn round_trip_keeps_literal_byte_piece_text() {
        // "<0x01>" typed as text, once through single-char pieces, once through byte fallback
        let mut with_chars = story_vocab();
        let mut pieces: Vec<(Vec<u8>, f32)> = (0..with_chars.vocab_size() as u32)
            .map(|i| (with_chars.piece(i).unwrap().to_vec(), with_chars.score(i).unwrap()))
            .collect();
        for c in ["<", "0", "x", "1", ">"] {
            pieces.push((c.as_bytes().to_vec(), -10.0));
        }
        with_chars = Tokenizer::from_pieces(pieces, 1, 2);

        let input = "once upon a time <0x01>";
        for tok in [with_chars, story_vocab()] {
            let ids = tok.encode(input, 1, 1);
            assert_eq!(ids[0], tok.bos_id());
            assert_eq!(*ids.last().unwrap(), tok.eos_id());

            let mut out = Vec::new();
            for w in ids.windows(2) {
                if w[1] == tok.eos_id() {
                    break;
                }
                out.extend_from_slice(&tok.decode(w[0], w[1]));
            }
            assert_eq!(String::from_utf8(out).unwrap(), input);
        }
    }

    #[test]
    fn unscorable_pieces_never_merge() {
        let pieces = vec![
            (b"<unk>".to_vec(), 0.0),
            (b"<s>".to_vec(), 0.0),
            (b"</s>".to_vec(), 0.0),
            (b"a".to_vec(), 0.0),
            (b"b".to_vec(), 0.0),
            (b"ab".to_vec(), f32::NEG_INFINITY),
            (b"c".to_vec(), 0.0),
            (b"cd".to_vec(), f32::NAN),
            (b"d".to_vec(), 0.0),
        ];
        let tok = Tokenizer::from_pieces(pieces, 1, 2);
        assert_eq!(tok.encode("ab", 0, 0), vec![3, 4]);
        assert_eq!(tok.encode("cd", 0, 0), vec![6, 8]);
    }

    #[test]
    fn encode_is_deterministic() {
        let tok = story_vocab();
        let a = tok.encode("a time upon once éé€", 1, 0);
        let b = tok.encode("a time upon once éé€", 1, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn decode_strips_space_after_bos_only() {
        let tok = story_vocab();
        let upon = id(&tok, " upon");
        assert_eq!(&*tok.decode(tok.bos_id(), upon), b"upon");
        assert_eq!(&*tok.decode(id(&tok, "once"), upon), b" upon");
    }

    #[test]
    fn decode_byte_piece() {
        let tok = story_vocab();
        assert_eq!(&*tok.decode(0, 0x41 + 3), b"A");
        assert_eq!(&*tok.decode(0, 0xFF + 3), &[0xFF]);
    }

    #[test]
    fn decode_out_of_range_is_empty() {
        let tok = story_vocab();
        let n = tok.vocab_size() as u32;
        assert!(!tok.decode_verify(n));
        assert!(tok.decode(0, n).is_empty());
        assert!(tok.decode(0, u32::MAX).is_empty());
    }

    #[test]
    fn byte_piece_parser_is_strict() {
        assert_eq!(parse_byte_piece(b"<0x0A>"), Some(0x0A));
        assert_eq!(parse_byte_piece(b"<0xzz>"), None);
        assert_eq!(parse_byte_piece(b"<0x0A"), None);
        assert_eq!(parse_byte_piece(b"<0x0A>>"), None);
    }

    #[test]
    fn small_vocab_never_merges_out_of_range_ids() {
        let pieces = vec![
            (b"<unk>".to_vec(), 0.0),
            (b"<s>".to_vec(), 0.0),
            (b"</s>".to_vec(), 0.0),
        ];
        let tok = Tokenizer::from_pieces(pieces, 1, 2);
        assert_eq!(tok.encode("hi", 0, 0), vec![b'h' as u32 + 3, b'i' as u32 + 3]);
    }

    #[test]
    fn file_round_trip() {
        let tok = story_vocab();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&tok.to_bytes()).unwrap();

        let mut loaded = Tokenizer::default();
        loaded.load(f.path()).unwrap();
        assert_eq!(loaded.vocab_size(), tok.vocab_size());
        assert_eq!(loaded.bos_id(), 1);
        assert_eq!(loaded.eos_id(), 2);
        assert_eq!(loaded.max_piece_len(), tok.max_piece_len());
        assert_eq!(
            loaded.encode("once upon a time", 1, 1),
            tok.encode("once upon a time", 1, 1)
        );
    }

    #[test]
    fn truncated_records_become_padding() {
        let mut bytes = Vec::new();
        for field in [4i32, 1, 2, 3] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        bytes.extend_from_slice(&1.5f32.to_le_bytes());
        bytes.extend_from_slice(&3i32.to_le_bytes());
        bytes.extend_from_slice(b"abc");
        bytes.extend_from_slice(&[0, 0]); // partial score

        let tok = Tokenizer::from_bytes(&bytes).unwrap();
        assert_eq!(tok.vocab_size(), 4);
        assert_eq!(tok.piece(0), Some(&b"abc"[..]));
        assert_eq!(tok.score(0), Some(1.5));
        for i in 1..4 {
            assert_eq!(tok.piece(i), Some(PAD_PIECE));
        }
    }

    #[test]
    fn truncated_piece_bytes_fail() {
        let mut bytes = Vec::new();
        for field in [1i32, 0, 0, 8] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        bytes.extend_from_slice(&0.0f32.to_le_bytes());
        bytes.extend_from_slice(&8i32.to_le_bytes());
        bytes.extend_from_slice(b"abc");
        let err = Tokenizer::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, StagehandError::VocabularyLoad(_)));
    }

    #[test]
    fn short_header_fails() {
        assert!(Tokenizer::from_bytes(&[1, 0, 0]).is_err());
        let mut bytes = Vec::new();
        for field in [-1i32, 0, 0, 0] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        assert!(Tokenizer::from_bytes(&bytes).is_err());
    }

    #[test]
    fn missing_file_leaves_vocab_empty() {
        let mut tok = Tokenizer::default();
        let err = tok.load(Path::new("/nonexistent/stagehand/tokenizer.bin"));
        assert!(matches!(err, Err(StagehandError::VocabularyLoad(_))));
        assert_eq!(tok.vocab_size(), 0);
    }
}
