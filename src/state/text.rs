//! Small English text helpers for player-facing messages.

use std::fmt::Display;

/// Join items with commas and a final "and".
///
/// `["a"]` gives `"a"`, `["a", "b"]` gives `"a and b"` and
/// `["a", "b", "c"]` gives `"a, b and c"`.
pub fn english_join_list<T: Display>(items: &[T]) -> String {
    let items: Vec<String> = items.iter().map(ToString::to_string).collect();
    match items.as_slice() {
        [] => String::new(),
        [only] => only.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

/// `"s"` unless `num` is 1 or -1 (for nouns).
pub fn plural_s(num: i64) -> &'static str {
    if num.abs() == 1 {
        ""
    } else {
        "s"
    }
}

/// `"s"` only when `num` is 1 (for verbs).
pub fn singular_s(num: i64) -> &'static str {
    if num == 1 {
        "s"
    } else {
        ""
    }
}

/// `"a"` for one, the number itself otherwise.
pub fn a_or_number(num: i64) -> String {
    if num == 1 {
        "a".to_string()
    } else {
        num.to_string()
    }
}

/// Replace the first `{}` in `template` with `value`.
pub(crate) fn fill(template: &str, value: &str) -> String {
    template.replacen("{}", value, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_english_join_list() {
        let empty: [&str; 0] = [];
        assert_eq!(english_join_list(&empty), "");
        assert_eq!(english_join_list(&["a"]), "a");
        assert_eq!(english_join_list(&["a", "b"]), "a and b");
        assert_eq!(english_join_list(&["a", "b", "c"]), "a, b and c");
        assert_eq!(english_join_list(&[1, 2, 3, 4]), "1, 2, 3 and 4");
    }

    #[test]
    fn test_plural_s() {
        assert_eq!(plural_s(0), "s");
        assert_eq!(plural_s(1), "");
        assert_eq!(plural_s(-1), "");
        assert_eq!(plural_s(2), "s");
    }

    #[test]
    fn test_singular_s() {
        assert_eq!(singular_s(0), "");
        assert_eq!(singular_s(1), "s");
        assert_eq!(singular_s(2), "");
    }

    #[test]
    fn test_a_or_number() {
        assert_eq!(a_or_number(1), "a");
        assert_eq!(a_or_number(3), "3");
    }

    #[test]
    fn test_fill() {
        assert_eq!(fill("Waiting for {}.", "Alice"), "Waiting for Alice.");
        assert_eq!(fill("No placeholder", "Alice"), "No placeholder");
    }
}
