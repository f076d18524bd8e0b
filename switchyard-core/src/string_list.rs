//! NUL-separated string lists, used for child/listener tag sets.

/// Does the NUL-separated `list` contain `value` as one of its
/// elements?  An empty `value` never matches.
pub fn string_list_contains(list: &str, value: &str) -> bool {
    !value.is_empty() && list.split('\0').any(|i| i == value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        assert!(string_list_contains("v1", "v1"));
        assert!(string_list_contains("v1\0v2", "v2"));
        assert!(!string_list_contains("v1\0v2", "v"));
        assert!(!string_list_contains("", "v1"));
        assert!(!string_list_contains("v1", ""));
    }
}
