//! Tokenizer seam for the index engine.
//!
//! The engine never tokenizes text itself: it consumes
//! `{text, position, start_offset, end_offset}` tuples from a pluggable
//! [`Tokenizer`]. A default Unicode word tokenizer is provided, and
//! tokenizers are looked up through an explicit [`TokenizerRegistry`] passed
//! into the index constructor rather than any process-global table.

use std::sync::Arc;

use ahash::AHashMap;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{Result, SedgeError};

/// A single token produced by a tokenizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Normalized token text.
    pub text: String,
    /// Position in the token stream (0-based).
    pub position: u64,
    /// Byte offset of the token's start in the original text.
    pub start_offset: usize,
    /// Byte offset one past the token's end in the original text.
    pub end_offset: usize,
}

impl Token {
    /// Create a token with offsets.
    pub fn new(text: impl Into<String>, position: u64, start: usize, end: usize) -> Self {
        Token {
            text: text.into(),
            position,
            start_offset: start,
            end_offset: end,
        }
    }
}

/// Boxed iterator of tokens.
pub type TokenStream<'a> = Box<dyn Iterator<Item = Token> + 'a>;

/// Trait for tokenizers that convert column text into tokens.
///
/// `language_id` selects a language-specific mode for tokenizers that
/// support one; the default tokenizer ignores it.
pub trait Tokenizer: Send + Sync + std::fmt::Debug {
    /// Tokenize the given text into a stream of tokens.
    fn tokenize<'a>(&self, text: &'a str, language_id: i64) -> Result<TokenStream<'a>>;

    /// The registered name of this tokenizer.
    fn name(&self) -> &'static str;
}

/// Default tokenizer: Unicode word bounds, lowercased, punctuation dropped.
#[derive(Debug, Default, Clone)]
pub struct SimpleTokenizer;

impl SimpleTokenizer {
    /// Create a new simple tokenizer.
    pub fn new() -> Self {
        SimpleTokenizer
    }
}

impl Tokenizer for SimpleTokenizer {
    fn tokenize<'a>(&self, text: &'a str, _language_id: i64) -> Result<TokenStream<'a>> {
        let iter = text
            .unicode_word_indices()
            .enumerate()
            .map(|(position, (start, word))| Token {
                text: word.to_lowercase(),
                position: position as u64,
                start_offset: start,
                end_offset: start + word.len(),
            });
        Ok(Box::new(iter))
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}

/// Factory closure producing tokenizer instances.
pub type TokenizerFactory = Arc<dyn Fn() -> Arc<dyn Tokenizer> + Send + Sync>;

/// Explicit tokenizer registry, passed into the index constructor.
///
/// Keyed by tokenizer name; `default` registers the simple tokenizer.
#[derive(Clone)]
pub struct TokenizerRegistry {
    factories: AHashMap<String, TokenizerFactory>,
}

impl std::fmt::Debug for TokenizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TokenizerRegistry {
    /// Create a registry containing only the simple tokenizer.
    pub fn new() -> Self {
        let mut registry = TokenizerRegistry {
            factories: AHashMap::new(),
        };
        registry.register("simple", || Arc::new(SimpleTokenizer::new()));
        registry
    }

    /// Register a tokenizer factory under `name`, replacing any previous
    /// registration.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Tokenizer> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Instantiate the tokenizer registered under `name`.
    pub fn create(&self, name: &str) -> Result<Arc<dyn Tokenizer>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| SedgeError::analysis(format!("unknown tokenizer: {name}")))
    }
}

impl Default for TokenizerRegistry {
    fn default() -> Self {
        TokenizerRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_tokenizer() {
        let tokenizer = SimpleTokenizer::new();
        let tokens: Vec<_> = tokenizer.tokenize("The quick fox!", 0).unwrap().collect();

        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].text, "the");
        assert_eq!(tokens[1].text, "quick");
        assert_eq!(tokens[2].text, "fox");
        assert_eq!(tokens[1].position, 1);
        assert_eq!(&"The quick fox!"[tokens[2].start_offset..tokens[2].end_offset], "fox");
    }

    #[test]
    fn test_empty_text() {
        let tokenizer = SimpleTokenizer::new();
        let tokens: Vec<_> = tokenizer.tokenize("", 0).unwrap().collect();
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = TokenizerRegistry::new();
        let tokenizer = registry.create("simple").unwrap();
        assert_eq!(tokenizer.name(), "simple");
        assert!(registry.create("porter").is_err());
    }

    #[test]
    fn test_registry_injection() {
        #[derive(Debug)]
        struct CommaTokenizer;

        impl Tokenizer for CommaTokenizer {
            fn tokenize<'a>(&self, text: &'a str, _language_id: i64) -> Result<TokenStream<'a>> {
                let tokens: Vec<Token> = text
                    .split(',')
                    .enumerate()
                    .map(|(i, s)| Token::new(s.trim(), i as u64, 0, 0))
                    .collect();
                Ok(Box::new(tokens.into_iter()))
            }

            fn name(&self) -> &'static str {
                "comma"
            }
        }

        let mut registry = TokenizerRegistry::new();
        registry.register("comma", || Arc::new(CommaTokenizer));

        let tokenizer = registry.create("comma").unwrap();
        let tokens: Vec<_> = tokenizer.tokenize("a, b", 0).unwrap().collect();
        assert_eq!(tokens[1].text, "b");
    }
}
