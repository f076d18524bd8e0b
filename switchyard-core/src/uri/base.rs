//! Functions for working with base URIs.

/// Is the given string a valid base string?  That is, does it end with
/// a slash?
pub fn is_base(uri: &str) -> bool {
    uri.ends_with('/')
}

/// Calculate the URI tail after a base URI from a request URI.
///
/// Returns `None` if no such tail URI is possible (e.g. if the
/// specified URI is not "within" the base, or if there is no base at
/// all).
pub fn base_tail<'a>(uri: &'a str, base: &str) -> Option<&'a str> {
    if !is_base(base) {
        /* not a valid base */
        return None;
    }

    uri.strip_prefix(base)
}

/// Determine the length of the base prefix in the given string: the
/// URI must end with `tail`, and the character right before the
/// suffix must be a slash.
///
/// Returns `None` on mismatch.
pub fn base_string(uri: &str, tail: &str) -> Option<usize> {
    if uri.len() == tail.len() {
        /* special case: zero-length prefix (not followed by a
           slash) */
        return (uri == tail).then_some(0);
    }

    (uri.len() > tail.len()
        && uri.as_bytes()[uri.len() - tail.len() - 1] == b'/'
        && uri.ends_with(tail))
    .then(|| uri.len() - tail.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_base() {
        assert!(is_base("/"));
        assert!(is_base("/foo/"));
        assert!(!is_base("/foo"));
        assert!(!is_base(""));
    }

    #[test]
    fn test_base_tail() {
        assert_eq!(base_tail("/foo/bar", "/foo/"), Some("bar"));
        assert_eq!(base_tail("/foo/", "/foo/"), Some(""));
        assert_eq!(base_tail("/foo/bar", "/foo"), None);
        assert_eq!(base_tail("/bar/x", "/foo/"), None);
    }

    #[test]
    fn test_base_string() {
        assert_eq!(base_string("/foo/bar", "bar"), Some(5));
        assert_eq!(base_string("/foo/bar", "/foo/bar"), Some(0));
        assert_eq!(base_string("", ""), Some(0));
        assert_eq!(base_string("/foo/bar", "ar"), None);
        assert_eq!(base_string("/foo/bar", "baz"), None);
        assert_eq!(base_string("bar", "/foo/bar"), None);
    }

    #[test]
    fn base_string_reconstructs_uri() {
        let uri = "/a/b/c";
        let tail = "b/c";
        let n = base_string(uri, tail).unwrap();
        assert_eq!(&uri[n..], tail);
        assert_eq!(uri.as_bytes()[n - 1], b'/');
    }
}
