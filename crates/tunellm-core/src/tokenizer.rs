use std::path::Path;

use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

use crate::error::{ResolveError, ResolveResult};
use crate::labels::TokenDecoder;

/// Thin wrapper around the Hugging Face `tokenizers` crate.
#[derive(Debug)]
pub struct Tokenizer {
    inner: HfTokenizer,
    eos_token_id: Option<u32>,
    bos_token_id: Option<u32>,
}

impl Tokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> ResolveResult<Self> {
        let inner = HfTokenizer::from_file(path).map_err(|e| ResolveError::Tokenizer(e.to_string()))?;
        let tokenizer = Self::from_hf(inner);
        debug!(
            path = %path.display(),
            eos_token_id = tokenizer.eos_token_id,
            bos_token_id = tokenizer.bos_token_id,
            vocab_size = tokenizer.vocab_size(),
            "Tokenizer loaded from file"
        );
        Ok(tokenizer)
    }

    /// Load the `tokenizer.json` that sits inside a model or checkpoint
    /// directory.
    pub fn from_model_dir(dir: &Path) -> ResolveResult<Self> {
        let path = dir.join("tokenizer.json");
        if !path.is_file() {
            return Err(ResolveError::PathNotFound {
                field: "tokenizer".to_string(),
                path,
            });
        }
        Self::from_file(&path)
    }

    pub fn from_hf(inner: HfTokenizer) -> Self {
        let eos_token_id = Self::special_token_id(&inner, &["</s>", "<|endoftext|>", "<|im_end|>", "<eos>"]);
        let bos_token_id = Self::special_token_id(&inner, &["<s>", "<|startoftext|>", "<bos>"]);
        Self {
            inner,
            eos_token_id,
            bos_token_id,
        }
    }

    /// Encode a text string to a sequence of token ids.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> ResolveResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| ResolveError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode a sequence of token ids back to a string.
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> ResolveResult<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| ResolveError::Tokenizer(e.to_string()))
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Look up the token id for an exact token string (e.g. `"<|im_end|>"`).
    pub fn token_id(&self, text: &str) -> Option<u32> {
        self.inner.token_to_id(text)
    }

    fn special_token_id(tokenizer: &HfTokenizer, candidates: &[&str]) -> Option<u32> {
        candidates.iter().find_map(|c| tokenizer.token_to_id(c))
    }
}

impl TokenDecoder for Tokenizer {
    fn decode_ids(&self, ids: &[u32]) -> ResolveResult<String> {
        self.decode(ids, false)
    }
}
