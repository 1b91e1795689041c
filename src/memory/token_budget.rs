//! Token 估算
//!
//! 优先调用注入的精确 Tokenizer（与当前模型族匹配时）；不可用或出错时退回
//! `字符数 / estimated_chars_per_token` 的近似值。估算永不失败。

use std::sync::Arc;

use crate::memory::Message;

/// 精确分词器（由具体模型后端提供）
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> Result<usize, String>;
}

/// Token 估算器
#[derive(Clone)]
pub struct TokenEstimator {
    tokenizer: Option<Arc<dyn Tokenizer>>,
    chars_per_token: usize,
    image_tokens: usize,
}

impl TokenEstimator {
    pub fn new(chars_per_token: usize, image_tokens: usize) -> Self {
        Self {
            tokenizer: None,
            chars_per_token: chars_per_token.max(1),
            image_tokens,
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// 估算文本 token 数
    pub fn estimate_text(&self, text: &str) -> usize {
        if let Some(tokenizer) = &self.tokenizer {
            match tokenizer.count_tokens(text) {
                Ok(n) => return n,
                Err(e) => tracing::debug!(error = %e, "tokenizer failed, using char estimate"),
            }
        }
        text.chars().count() / self.chars_per_token
    }

    /// 估算整条消息（含截图固定开销）
    pub fn estimate(&self, message: &Message) -> usize {
        let mut tokens = self.estimate_text(&message.content);
        if message.image.is_some() {
            tokens += self.image_tokens;
        }
        tokens
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(3, 800)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WordTokenizer;

    impl Tokenizer for WordTokenizer {
        fn count_tokens(&self, text: &str) -> Result<usize, String> {
            Ok(text.split_whitespace().count())
        }
    }

    struct BrokenTokenizer;

    impl Tokenizer for BrokenTokenizer {
        fn count_tokens(&self, _text: &str) -> Result<usize, String> {
            Err("model family not supported".to_string())
        }
    }

    #[test]
    fn test_char_estimate_default_divisor() {
        let estimator = TokenEstimator::default();
        assert_eq!(estimator.estimate_text("abcdefghi"), 3);
        assert_eq!(estimator.estimate_text(""), 0);
    }

    #[test]
    fn test_exact_tokenizer_preferred() {
        let estimator = TokenEstimator::default().with_tokenizer(Arc::new(WordTokenizer));
        assert_eq!(estimator.estimate_text("one two three four"), 4);
    }

    #[test]
    fn test_tokenizer_failure_falls_back() {
        let estimator = TokenEstimator::default().with_tokenizer(Arc::new(BrokenTokenizer));
        assert_eq!(estimator.estimate_text("abcdef"), 2);
    }

    #[test]
    fn test_image_adds_fixed_cost() {
        let estimator = TokenEstimator::new(3, 800);
        let msg = Message::user("abc").with_image("iVBORw0KGgo=");
        assert_eq!(estimator.estimate(&msg), 801);
    }

    #[test]
    fn test_zero_divisor_is_clamped() {
        let estimator = TokenEstimator::new(0, 0);
        assert_eq!(estimator.estimate_text("abcd"), 4);
    }
}
