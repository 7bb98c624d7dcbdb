//! Shared utility helpers.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of the random suffix on public identifiers.
const PUBLIC_ID_LEN: usize = 42;

/// Generate a public identifier: `<prefix>_` followed by 42 random
/// URL-safe alphanumeric characters.
///
/// Prefixes in use: `conv` (conversations), `msg` (items), `resp`
/// (responses), `mdl` (models), `proj` (projects).
pub fn public_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PUBLIC_ID_LEN)
        .map(char::from)
        .collect();
    format!("{prefix}_{suffix}")
}

/// Count whitespace-separated tokens in a string.
pub fn whitespace_tokens(s: &str) -> usize {
    s.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_id_shape() {
        let id = public_id("resp");
        assert!(id.starts_with("resp_"));
        assert_eq!(id.len(), "resp_".len() + 42);
        assert!(id
            .chars()
            .skip(5)
            .all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn public_ids_are_unique() {
        let a = public_id("conv");
        let b = public_id("conv");
        assert_ne!(a, b);
    }

    #[test]
    fn token_counting() {
        assert_eq!(whitespace_tokens(""), 0);
        assert_eq!(whitespace_tokens("one two  three\nfour"), 4);
    }
}
