//! Load-balancing tie-break over resolved candidates.

use rand::Rng;

/// Pick one candidate uniformly at random.
///
/// Returns `None` for an empty list. A single candidate is returned without
/// touching the RNG.
pub fn pick(candidates: &[String]) -> Option<&str> {
    match candidates {
        [] => None,
        [only] => Some(only.as_str()),
        _ => pick_with(candidates, &mut rand::thread_rng()),
    }
}

/// [`pick`] with a caller-supplied RNG.
pub fn pick_with<'a, R: Rng + ?Sized>(candidates: &'a [String], rng: &mut R) -> Option<&'a str> {
    match candidates {
        [] => None,
        [only] => Some(only.as_str()),
        _ => Some(candidates[rng.gen_range(0..candidates.len())].as_str()),
    }
}
