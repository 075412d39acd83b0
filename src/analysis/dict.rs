use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use rust_stemmers::{Algorithm, Stemmer};
use serde::{Serialize, Deserialize};

use crate::core::error::{Error, Result};
use crate::core::types::WordId;

/// Dictionary settings carried in the index header so the daemon can
/// rebuild an identical dict for query-time word mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DictSettings {
    pub min_word_len: usize,
    pub morphology: Option<String>,
    pub stopwords_file: Option<String>,
    pub wordforms_file: Option<String>,
}

/// Multi-token wordform table; maps a phrase of source tokens onto a
/// destination token. Kept separate from single-word forms because the
/// indexing loop must look ahead over token windows to apply them.
#[derive(Debug, Clone, Default)]
pub struct MultiWordforms {
    pub forms: HashMap<Vec<String>, String>,
    pub max_tokens: usize,
}

/// word → id mapping with optional morphology, stopwords, wordforms.
/// Id 0 means "stopword or otherwise filtered".
pub trait Dict: Send {
    fn word_id(&mut self, w: &[u8]) -> WordId;
    fn multiword_forms(&self) -> &MultiWordforms;
    fn settings(&self) -> &DictSettings;
}

pub struct StandardDict {
    settings: DictSettings,
    stopwords: HashSet<WordId>,
    wordforms: HashMap<String, String>,
    multiforms: MultiWordforms,
    stemmer: Option<Stemmer>,
}

impl StandardDict {
    pub fn new(settings: DictSettings) -> Result<Self> {
        let stemmer = match settings.morphology.as_deref() {
            None | Some("none") => None,
            Some("stem_en") => Some(Stemmer::create(Algorithm::English)),
            Some(other) => {
                return Err(Error::config(format!("unknown morphology '{}'", other)));
            }
        };
        let mut dict = StandardDict {
            settings,
            stopwords: HashSet::new(),
            wordforms: HashMap::new(),
            multiforms: MultiWordforms::default(),
            stemmer,
        };
        if let Some(path) = dict.settings.stopwords_file.clone() {
            dict.load_stopwords(&path)?;
        }
        if let Some(path) = dict.settings.wordforms_file.clone() {
            dict.load_wordforms(&path)?;
        }
        Ok(dict)
    }

    /// Stopword file: one word per line; normalized the same way
    /// indexed words are before hashing.
    pub fn load_stopwords(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let text = fs::read_to_string(&path).map_err(|e| {
            Error::config(format!("failed to read stopwords {}: {}", path.as_ref().display(), e))
        })?;
        let words: Vec<String> = text.split_whitespace().map(|w| w.to_lowercase()).collect();
        for word in words {
            let normalized = self.normalize(&word);
            self.stopwords.insert(hash_word(normalized.as_bytes()));
        }
        Ok(())
    }

    pub fn add_stopwords(&mut self, words: &[&str]) {
        for word in words {
            let normalized = self.normalize(&word.to_lowercase());
            self.stopwords.insert(hash_word(normalized.as_bytes()));
        }
    }

    /// Wordform file: `source > destination` per line; multi-token
    /// sources go to the lookahead table.
    pub fn load_wordforms(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let text = fs::read_to_string(&path).map_err(|e| {
            Error::config(format!("failed to read wordforms {}: {}", path.as_ref().display(), e))
        })?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((src, dst)) = line.split_once('>') else {
                return Err(Error::config(format!("bad wordform line '{}'", line)));
            };
            let dst = dst.trim().to_lowercase();
            let src_tokens: Vec<String> =
                src.split_whitespace().map(|t| t.to_lowercase()).collect();
            match src_tokens.len() {
                0 => return Err(Error::config(format!("bad wordform line '{}'", line))),
                1 => {
                    self.wordforms.insert(src_tokens[0].clone(), dst);
                }
                n => {
                    self.multiforms.max_tokens = self.multiforms.max_tokens.max(n);
                    self.multiforms.forms.insert(src_tokens, dst);
                }
            }
        }
        Ok(())
    }

    fn normalize(&self, word: &str) -> String {
        let word = match self.wordforms.get(word) {
            Some(form) => form.clone(),
            None => word.to_string(),
        };
        match &self.stemmer {
            Some(stemmer) => stemmer.stem(&word).into_owned(),
            None => word,
        }
    }
}

impl Dict for StandardDict {
    fn word_id(&mut self, w: &[u8]) -> WordId {
        let Ok(word) = std::str::from_utf8(w) else { return 0 };
        let normalized = self.normalize(word);
        let id = hash_word(normalized.as_bytes());
        if self.stopwords.contains(&id) { 0 } else { id }
    }

    fn multiword_forms(&self) -> &MultiWordforms {
        &self.multiforms
    }

    fn settings(&self) -> &DictSettings {
        &self.settings
    }
}

/// FNV-1a, with 0 remapped since 0 is the "filtered" sentinel.
pub fn hash_word(bytes: &[u8]) -> WordId {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    if hash == 0 { 1 } else { hash }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwords_map_to_zero() {
        let mut dict = StandardDict::new(DictSettings::default()).unwrap();
        dict.add_stopwords(&["the"]);
        assert_eq!(dict.word_id(b"the"), 0);
        assert_ne!(dict.word_id(b"quick"), 0);
    }

    #[test]
    fn word_ids_are_stable() {
        let mut dict = StandardDict::new(DictSettings::default()).unwrap();
        assert_eq!(dict.word_id(b"fox"), dict.word_id(b"fox"));
        assert_ne!(dict.word_id(b"fox"), dict.word_id(b"dog"));
    }

    #[test]
    fn stemming_conflates_inflections() {
        let settings = DictSettings { morphology: Some("stem_en".to_string()), ..Default::default() };
        let mut dict = StandardDict::new(settings).unwrap();
        assert_eq!(dict.word_id(b"running"), dict.word_id(b"run"));
    }

    #[test]
    fn stopwords_apply_after_morphology() {
        let settings = DictSettings { morphology: Some("stem_en".to_string()), ..Default::default() };
        let mut dict = StandardDict::new(settings).unwrap();
        dict.add_stopwords(&["runs"]);
        assert_eq!(dict.word_id(b"running"), 0);
    }
}
