use unicode_segmentation::UnicodeSegmentation;

/// Streaming word tokenizer contract consumed by the indexing pipeline
/// and the query lexer. The core never inspects token interior bytes
/// except to hand them to the dict or to compare.
pub trait Tokenizer: Send {
    fn set_buffer(&mut self, bytes: &[u8]);
    /// Next UTF-8 token, or None at end of buffer.
    fn next(&mut self) -> Option<&[u8]>;
    /// Positions skipped since the last call (too-short words).
    fn overshort_count(&mut self) -> u32;
    /// True when the token just returned was an operator char passed
    /// through in query mode.
    fn was_special(&self) -> bool;
    fn is_utf8(&self) -> bool;
    fn clone_configured(&self) -> Box<dyn Tokenizer>;
}

/// Query-mode operator characters passed through as single tokens.
const SPECIALS: &[char] =
    &['(', ')', '|', '-', '!', '@', '~', '"', '/', '^', '$', '<', ',', '*', '&', '[', ']'];

/// Standard Unicode tokenizer: word boundaries from unicode-segmentation,
/// lowercasing, minimum word length with overshort counting.
pub struct StandardTokenizer {
    pub min_word_len: usize,
    pub query_mode: bool,
    segments: Vec<Segment>,
    cursor: usize,
    current: Vec<u8>,
    overshorts: u32,
    last_special: bool,
}

enum Segment {
    Word(String),
    Special(char),
}

impl StandardTokenizer {
    pub fn new(min_word_len: usize) -> Self {
        StandardTokenizer {
            min_word_len: min_word_len.max(1),
            query_mode: false,
            segments: Vec::new(),
            cursor: 0,
            current: Vec::new(),
            overshorts: 0,
            last_special: false,
        }
    }

    /// Query-mode clone: operator characters become single tokens.
    pub fn query_mode(mut self) -> Self {
        self.query_mode = true;
        self
    }

    fn split(&mut self, text: &str) {
        self.segments.clear();
        for segment in text.split_word_bounds() {
            let word: String = segment
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .flat_map(|c| c.to_lowercase())
                .collect();
            if !word.is_empty() {
                self.segments.push(Segment::Word(word));
                continue;
            }
            if self.query_mode {
                for c in segment.chars() {
                    if SPECIALS.contains(&c) {
                        self.segments.push(Segment::Special(c));
                    }
                }
            }
        }
    }
}

impl Tokenizer for StandardTokenizer {
    fn set_buffer(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes).into_owned();
        self.split(&text);
        self.cursor = 0;
        self.overshorts = 0;
        self.last_special = false;
    }

    fn next(&mut self) -> Option<&[u8]> {
        while self.cursor < self.segments.len() {
            let idx = self.cursor;
            self.cursor += 1;
            match &self.segments[idx] {
                Segment::Word(word) => {
                    if word.chars().count() < self.min_word_len {
                        self.overshorts += 1;
                        continue;
                    }
                    self.last_special = false;
                    self.current.clear();
                    self.current.extend_from_slice(word.as_bytes());
                    return Some(&self.current);
                }
                Segment::Special(c) => {
                    self.last_special = true;
                    self.current.clear();
                    let mut buf = [0u8; 4];
                    self.current.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    return Some(&self.current);
                }
            }
        }
        None
    }

    fn overshort_count(&mut self) -> u32 {
        std::mem::take(&mut self.overshorts)
    }

    fn was_special(&self) -> bool {
        self.last_special
    }

    fn is_utf8(&self) -> bool {
        true
    }

    fn clone_configured(&self) -> Box<dyn Tokenizer> {
        let mut clone = StandardTokenizer::new(self.min_word_len);
        clone.query_mode = self.query_mode;
        Box::new(clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(t: &mut StandardTokenizer, text: &str) -> Vec<String> {
        t.set_buffer(text.as_bytes());
        let mut out = Vec::new();
        while let Some(tok) = t.next() {
            out.push(String::from_utf8(tok.to_vec()).unwrap());
        }
        out
    }

    #[test]
    fn plain_mode_drops_punctuation() {
        let mut t = StandardTokenizer::new(1);
        assert_eq!(drain(&mut t, "The quick, Brown fox!"), ["the", "quick", "brown", "fox"]);
    }

    #[test]
    fn query_mode_passes_specials() {
        let mut t = StandardTokenizer::new(1).query_mode();
        assert_eq!(
            drain(&mut t, "\"a b\"~2 | @title -x"),
            ["\"", "a", "b", "\"", "~", "2", "|", "@", "title", "-", "x"]
        );
    }

    #[test]
    fn overshorts_are_counted() {
        let mut t = StandardTokenizer::new(3);
        assert_eq!(drain(&mut t, "an ox jumped"), ["jumped"]);
        assert_eq!(t.overshort_count(), 2);
        assert_eq!(t.overshort_count(), 0);
    }

    #[test]
    fn was_special_tracks_last_token() {
        let mut t = StandardTokenizer::new(1).query_mode();
        t.set_buffer(b"@title");
        t.next().unwrap();
        assert!(t.was_special());
        t.next().unwrap();
        assert!(!t.was_special());
    }
}
