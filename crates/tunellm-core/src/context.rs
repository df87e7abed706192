//! Context-window management: keep the longest suffix of a conversation that
//! still fits the model's length budget.

use std::cell::Cell;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chat_template::{build_chat_prompt, ChatFormat};
use crate::error::ResolveResult;
use crate::search::try_upper_bound;
use crate::tokenizer::Tokenizer;

/// One completed exchange in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub query: String,
    pub response: String,
}

impl Turn {
    pub fn new(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            response: response.into(),
        }
    }
}

/// Measures how many tokens a prompt would occupy.
pub trait PromptEncoder {
    fn encoded_len(&self, query: &str, history: &[Turn], system: &str) -> ResolveResult<usize>;
}

/// [`PromptEncoder`] that renders the chat template and tokenizes it.
pub struct TemplateEncoder<'a> {
    tokenizer: &'a Tokenizer,
    format: ChatFormat,
}

impl<'a> TemplateEncoder<'a> {
    pub fn new(tokenizer: &'a Tokenizer, template_type: &str) -> Self {
        Self {
            tokenizer,
            format: ChatFormat::from_template_type(template_type),
        }
    }
}

impl PromptEncoder for TemplateEncoder<'_> {
    fn encoded_len(&self, query: &str, history: &[Turn], system: &str) -> ResolveResult<usize> {
        let prompt = build_chat_prompt(self.format, system, history, query);
        Ok(self.tokenizer.encode(&prompt, false)?.len())
    }
}

/// Result of [`limit_history_length`]: `history` is the kept suffix,
/// `old_history` the dropped prefix. Concatenated they equal the input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Truncation {
    pub history: Vec<Turn>,
    pub old_history: Vec<Turn>,
}

/// Keep the longest suffix of `history` whose encoded prompt fits in
/// `max_length` tokens.
///
/// Encoded length is assumed non-decreasing in the number of kept turns, so
/// the suffix length is found by binary search with O(log n) encoder calls.
/// The empty suffix is never encoded. If even the most recent turn does not
/// fit, the whole history moves to `old_history`. `max_length == None` keeps
/// everything.
pub fn limit_history_length<E: PromptEncoder + ?Sized>(
    encoder: &E,
    query: &str,
    history: &[Turn],
    system: &str,
    max_length: Option<usize>,
) -> ResolveResult<Truncation> {
    let Some(max_length) = max_length else {
        return Ok(Truncation {
            history: history.to_vec(),
            old_history: Vec::new(),
        });
    };

    let n = history.len();
    let evaluations = Cell::new(0usize);
    let kept = try_upper_bound(0, n, |k| -> ResolveResult<bool> {
        evaluations.set(evaluations.get() + 1);
        let len = encoder.encoded_len(query, &history[n - k..], system)?;
        Ok(len <= max_length)
    })?;

    debug!(
        turns = n,
        kept,
        max_length,
        evaluations = evaluations.get(),
        "Limited history length"
    );
    let (old, recent) = history.split_at(n - kept);
    Ok(Truncation {
        history: recent.to_vec(),
        old_history: old.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::fixtures::word_level;
    use proptest::prelude::*;
    use std::cell::RefCell;

    /// Counts bytes, optionally recording the suffix lengths it was asked for.
    #[derive(Default)]
    struct ByteCounter {
        calls: RefCell<Vec<usize>>,
    }

    impl PromptEncoder for ByteCounter {
        fn encoded_len(&self, query: &str, history: &[Turn], system: &str) -> ResolveResult<usize> {
            self.calls.borrow_mut().push(history.len());
            Ok(system.len() + query.len() + history.iter().map(|t| t.query.len() + t.response.len()).sum::<usize>())
        }
    }

    fn history_of(sizes: &[usize]) -> Vec<Turn> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| Turn::new(format!("{i}"), "x".repeat(n)))
            .collect()
    }

    #[test]
    fn test_empty_history() {
        let enc = ByteCounter::default();
        let out = limit_history_length(&enc, "hello", &[], "", Some(1)).unwrap();
        assert_eq!(out, Truncation::default());
        assert!(enc.calls.borrow().is_empty());
    }

    #[test]
    fn test_nothing_fits_moves_everything_to_old_history() {
        let enc = ByteCounter::default();
        let history = history_of(&[10, 10, 10]);
        let out = limit_history_length(&enc, "q", &history, "", Some(5)).unwrap();
        assert!(out.history.is_empty());
        assert_eq!(out.old_history, history);
        assert!(!enc.calls.borrow().contains(&0));
    }

    #[test]
    fn test_keeps_most_recent_turns() {
        let enc = ByteCounter::default();
        // Turn cost is 1 (index digit) + response length.
        let history = history_of(&[50, 3, 3, 3]);
        let out = limit_history_length(&enc, "q", &history, "", Some(13)).unwrap();
        assert_eq!(out.history, history[1..].to_vec());
        assert_eq!(out.old_history, history[..1].to_vec());
    }

    #[test]
    fn test_no_limit_keeps_everything() {
        let enc = ByteCounter::default();
        let history = history_of(&[100, 100]);
        let out = limit_history_length(&enc, "q", &history, "", None).unwrap();
        assert_eq!(out.history, history);
        assert!(out.old_history.is_empty());
        assert!(enc.calls.borrow().is_empty());
    }

    #[test]
    fn test_encoder_calls_are_logarithmic() {
        let enc = ByteCounter::default();
        let history = history_of(&[1; 1000]);
        limit_history_length(&enc, "q", &history, "", Some(700)).unwrap();
        assert!(enc.calls.borrow().len() <= 11, "{} calls", enc.calls.borrow().len());
    }

    #[test]
    fn test_template_encoder_with_real_tokenizer() {
        let tok = word_level(&[("hi", 1), ("there", 2), ("again", 3)]);
        let enc = TemplateEncoder::new(&tok, "default-generation");
        // Generation templates encode only the query.
        assert_eq!(enc.encoded_len("hi there", &[Turn::new("again", "again")], "").unwrap(), 2);

        let enc = TemplateEncoder::new(&tok, "other");
        let history = vec![Turn::new("hi", "there"), Turn::new("again", "there")];
        let full = enc.encoded_len("hi", &history, "").unwrap();
        let one = enc.encoded_len("hi", &history[1..], "").unwrap();
        assert!(one < full);
        let out = limit_history_length(&enc, "hi", &history, "", Some(one)).unwrap();
        assert_eq!(out.history, history[1..].to_vec());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_kept_suffix_is_maximal(
            sizes in prop::collection::vec(0usize..40, 0..30),
            query_len in 0usize..20,
            max_length in 0usize..400
        ) {
            let enc = ByteCounter::default();
            let query = "q".repeat(query_len);
            let history = history_of(&sizes);
            let out = limit_history_length(&enc, &query, &history, "", Some(max_length)).unwrap();

            let k = out.history.len();
            prop_assert_eq!(out.old_history.len() + k, history.len());
            prop_assert_eq!(&out.history[..], &history[history.len() - k..]);
            if k > 0 {
                prop_assert!(enc.encoded_len(&query, &out.history, "").unwrap() <= max_length);
            }
            if k < history.len() {
                let one_more = &history[history.len() - k - 1..];
                prop_assert!(enc.encoded_len(&query, one_more, "").unwrap() > max_length);
            }
        }

        #[test]
        fn prop_truncation_is_idempotent(
            sizes in prop::collection::vec(0usize..40, 0..30),
            max_length in 0usize..400
        ) {
            let enc = ByteCounter::default();
            let history = history_of(&sizes);
            let once = limit_history_length(&enc, "q", &history, "sys", Some(max_length)).unwrap();
            let twice = limit_history_length(&enc, "q", &once.history, "sys", Some(max_length)).unwrap();
            prop_assert_eq!(twice.history, once.history);
            prop_assert!(twice.old_history.is_empty());
        }
    }
}
