//! Binary search over integer ranges driven by a monotone predicate.

use std::convert::Infallible;

/// Smallest `x` in `[lo, hi)` with `pred(x)` true, or `hi` when none.
///
/// `pred` must be monotone false → true over the range.
pub fn lower_bound(lo: usize, hi: usize, mut pred: impl FnMut(usize) -> bool) -> usize {
    match try_lower_bound(lo, hi, |x| Ok::<_, Infallible>(pred(x))) {
        Ok(x) => x,
        Err(never) => match never {},
    }
}

/// Largest `x` in `[lo, hi]` with `pred(x)` true, or `lo` when none.
///
/// `pred` must be monotone true → false over the range. `pred(lo)` is never
/// evaluated: `lo` is the answer whenever nothing above it qualifies.
pub fn upper_bound(lo: usize, hi: usize, mut pred: impl FnMut(usize) -> bool) -> usize {
    match try_upper_bound(lo, hi, |x| Ok::<_, Infallible>(pred(x))) {
        Ok(x) => x,
        Err(never) => match never {},
    }
}

/// [`lower_bound`] with a fallible predicate; the first error aborts the search.
pub fn try_lower_bound<E>(
    mut lo: usize,
    mut hi: usize,
    mut pred: impl FnMut(usize) -> Result<bool, E>,
) -> Result<usize, E> {
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid)? {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

/// [`upper_bound`] with a fallible predicate; the first error aborts the search.
pub fn try_upper_bound<E>(
    mut lo: usize,
    mut hi: usize,
    mut pred: impl FnMut(usize) -> Result<bool, E>,
) -> Result<usize, E> {
    while lo < hi {
        // Round up so `mid > lo` and the loop always makes progress.
        let mid = lo + (hi - lo + 1) / 2;
        if pred(mid)? {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_bound() {
        assert_eq!(lower_bound(0, 10, |x| x >= 4), 4);
        assert_eq!(lower_bound(0, 10, |_| true), 0);
        assert_eq!(lower_bound(0, 10, |_| false), 10);
        assert_eq!(lower_bound(3, 3, |_| true), 3);
    }

    #[test]
    fn test_upper_bound() {
        assert_eq!(upper_bound(0, 10, |x| x <= 6), 6);
        assert_eq!(upper_bound(0, 10, |_| true), 10);
        assert_eq!(upper_bound(0, 10, |_| false), 0);
        assert_eq!(upper_bound(5, 5, |_| false), 5);
    }

    #[test]
    fn test_upper_bound_never_evaluates_lo() {
        for hi in 0..40 {
            let mut seen = Vec::new();
            upper_bound(0, hi, |x| {
                seen.push(x);
                x <= hi / 3
            });
            assert!(!seen.contains(&0), "hi={hi} evaluated 0: {seen:?}");
        }
    }

    #[test]
    fn test_evaluations_are_logarithmic() {
        let mut calls = 0;
        upper_bound(0, 1 << 20, |x| {
            calls += 1;
            x < 12345
        });
        assert!(calls <= 21, "{calls} evaluations");
    }

    #[test]
    fn test_fallible_predicate_propagates_error() {
        let out: Result<usize, &str> = try_upper_bound(0, 8, |x| if x == 4 { Err("boom") } else { Ok(true) });
        assert_eq!(out, Err("boom"));
        let out: Result<usize, &str> = try_lower_bound(0, 8, |x| Ok(x >= 2));
        assert_eq!(out, Ok(2));
    }
}
