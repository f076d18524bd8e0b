//! Path verification and normalization for cache lookups.

/// Quick sanity check: an absolute path without NUL bytes or control
/// characters.
pub fn uri_path_verify_quick(path: &str) -> bool {
    path.starts_with('/') && !path.bytes().any(|ch| ch < 0x20)
}

/// Paranoid verification of a relative path that is about to be
/// appended to a cached base: no control characters, no empty
/// segments hiding a `..`, no `.`/`..` segments at all.
pub fn uri_path_verify_paranoid(path: &str) -> bool {
    if path.bytes().any(|ch| ch < 0x20) {
        return false;
    }

    /* the fragment before a '?' is the only part that is ever mapped
       to a filesystem path */
    let path = match path.find('?') {
        Some(q) => &path[..q],
        None => path,
    };

    path.split('/').all(|segment| segment != "." && segment != "..")
}

/// Normalize a URI path fragment: merge adjacent slashes and drop
/// `./` segments.  `..` is left alone; the paranoid check rejects it
/// afterwards.
pub fn normalize_uri_path(path: &str) -> String {
    let mut dest = String::with_capacity(path.len());
    let mut segments = path.split('/').peekable();
    let mut first = true;

    while let Some(segment) = segments.next() {
        let last = segments.peek().is_none();

        if segment == "." || (segment.is_empty() && !last) {
            /* preserve a trailing slash, drop everything else */
            if last && !dest.ends_with('/') && !first {
                dest.push('/');
            }
            continue;
        }

        if !first && !dest.ends_with('/') {
            dest.push('/');
        }
        dest.push_str(segment);
        first = false;
    }

    dest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_paranoid() {
        assert!(uri_path_verify_paranoid("foo/bar"));
        assert!(uri_path_verify_paranoid(""));
        assert!(uri_path_verify_paranoid("foo/bar?x=../y"));
        assert!(!uri_path_verify_paranoid("../foo"));
        assert!(!uri_path_verify_paranoid("foo/../bar"));
        assert!(!uri_path_verify_paranoid("foo/./bar"));
        assert!(!uri_path_verify_paranoid("foo\nbar"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_uri_path("foo//bar"), "foo/bar");
        assert_eq!(normalize_uri_path("./foo"), "foo");
        assert_eq!(normalize_uri_path("foo/./bar"), "foo/bar");
        assert_eq!(normalize_uri_path("foo/"), "foo/");
        assert_eq!(normalize_uri_path("foo"), "foo");
    }
}
