//! Human-readable rendering of training label sequences.

use crate::error::{ResolveError, ResolveResult};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Turns token ids back into text.
pub trait TokenDecoder {
    fn decode_ids(&self, ids: &[u32]) -> ResolveResult<String>;
}

/// Render `labels` with every run of [`IGNORE_INDEX`] collapsed to a
/// `[-100 * N]` marker and every other run decoded as one span.
///
/// `[-100, -100, 7, 8]` becomes `"[-100 * 2]"` followed by the decoding of
/// `[7, 8]`. Runs are emitted back to back with no separator.
pub fn labels_to_string<D: TokenDecoder + ?Sized>(labels: &[i64], decoder: &D) -> ResolveResult<String> {
    let mut out = String::new();
    for run in labels.chunk_by(|a, b| (*a == IGNORE_INDEX) == (*b == IGNORE_INDEX)) {
        if run[0] == IGNORE_INDEX {
            out.push_str(&format!("[{IGNORE_INDEX} * {}]", run.len()));
        } else {
            let ids = run
                .iter()
                .map(|&id| {
                    u32::try_from(id).map_err(|_| ResolveError::validation("labels", format!("{id} is not a token id")))
                })
                .collect::<ResolveResult<Vec<u32>>>()?;
            out.push_str(&decoder.decode_ids(&ids)?);
        }
    }
    Ok(out)
}
