use crate::error::{Result, SetupError};
use std::collections::HashMap;
use tokenizers::{AddedToken, Tokenizer};

/// Token vocabulary of the text encoder
pub trait Vocabulary {
    /// Token ids for `text`, without special tokens
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Id of a single token, if known
    fn token_id(&self, token: &str) -> Option<u32>;

    /// Add `tokens` and return their ids in order. Known tokens keep their id.
    fn add_tokens(&mut self, tokens: &[String]) -> Result<Vec<u32>>;

    /// Number of tokens including added ones
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whitespace-split vocabulary with an optional unknown token
#[derive(Debug, Clone, Default)]
pub struct WordVocabulary {
    ids: HashMap<String, u32>,
    tokens: Vec<String>,
    unknown: Option<u32>,
}

impl WordVocabulary {
    pub fn new<S: AsRef<str>>(words: &[S]) -> Self {
        let mut vocab = Self::default();
        for word in words {
            vocab.insert(word.as_ref());
        }
        vocab
    }

    /// Map unknown words to `token`, adding it if needed
    pub fn with_unknown(mut self, token: &str) -> Self {
        self.unknown = Some(self.insert(token));
        self
    }

    fn insert(&mut self, token: &str) -> u32 {
        if let Some(id) = self.ids.get(token) {
            return *id;
        }
        let id = self.tokens.len() as u32;
        self.ids.insert(token.to_string(), id);
        self.tokens.push(token.to_string());
        id
    }
}

impl Vocabulary for WordVocabulary {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.split_whitespace()
            .map(|word| {
                self.ids
                    .get(word)
                    .or_else(|| self.ids.get(&word.to_lowercase()))
                    .copied()
                    .or(self.unknown)
                    .ok_or_else(|| SetupError::Tokenizer(format!("unknown word '{}'", word)))
            })
            .collect()
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    fn add_tokens(&mut self, tokens: &[String]) -> Result<Vec<u32>> {
        Ok(tokens.iter().map(|token| self.insert(token)).collect())
    }

    fn len(&self) -> usize {
        self.tokens.len()
    }
}

impl Vocabulary for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = (**self)
            .encode(text, false)
            .map_err(|e| SetupError::Tokenizer(format!("cannot encode '{}': {}", text, e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        (**self).token_to_id(token)
    }

    fn add_tokens(&mut self, tokens: &[String]) -> Result<Vec<u32>> {
        let added: Vec<AddedToken> = tokens
            .iter()
            .map(|token| AddedToken::from(token.clone(), false))
            .collect();
        (**self).add_tokens(&added);

        tokens
            .iter()
            .map(|token| {
                (**self)
                    .token_to_id(token)
                    .ok_or_else(|| SetupError::Tokenizer(format!("token '{}' was not added", token)))
            })
            .collect()
    }

    fn len(&self) -> usize {
        (**self).get_vocab_size(true)
    }
}
