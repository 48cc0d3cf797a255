//! Tokenizer seam.
//!
//! Real tokenizer integration lives outside the core; record processors
//! reach it through this trait. When no tokenizer is wired and the server
//! reports no usage, token counts stay unknown.

/// Counts and encodes tokens for a model's vocabulary.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;

    fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// Whitespace-splitting tokenizer, for tests and rough local estimates.
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .enumerate()
            .map(|(i, _)| i as u32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_matches_encode_length() {
        let tokenizer = WhitespaceTokenizer;
        let prompt = "the quick brown fox";
        assert_eq!(tokenizer.encode(prompt).len(), tokenizer.count_tokens(prompt));
        assert_eq!(tokenizer.count_tokens(prompt), 4);
        assert_eq!(tokenizer.count_tokens(""), 0);
    }
}
