//! Path compression: eliminate `//`, `/./` and `/../` segments.

use std::borrow::Cow;

/// Eliminate `//`, `/./` and `/../` from the URI, resolving `..` with
/// backtracking.  Returns `None` when a `..` would pop above the root.
///
/// A canonical input is returned as `Cow::Borrowed` without
/// allocating.
pub fn uri_compress(mut uri: &str) -> Option<Cow<'_, str>> {
    while let Some(rest) = uri.strip_prefix("./") {
        uri = rest;
    }

    if uri == ".." || uri.starts_with("../") {
        return None;
    }

    if uri == "." {
        /* if the string doesn't start with a slash, then an empty
           return value is allowed */
        return Some(Cow::Borrowed(""));
    }

    if !uri.contains("//") && !uri.contains("/.") {
        /* cheap route: the URI is already compressed, do not
           duplicate anything */
        return Some(Cow::Borrowed(uri));
    }

    let mut dest = uri.as_bytes().to_vec();

    /* eliminate "//" */

    while let Some(p) = find(&dest, b"//") {
        dest.remove(p);
    }

    /* eliminate "/./" */

    while let Some(p) = find(&dest, b"/./") {
        dest.drain(p..p + 2);
    }

    /* eliminate "/../" with backtracking */

    while let Some(p) = find(&dest, b"/../") {
        if p == 0 {
            /* this ".." cannot be resolved */
            return None;
        }

        /* backtrack to the previous slash */
        let q = dest[..p].iter().rposition(|&c| c == b'/').map_or(0, |i| i);
        if dest[q] == b'/' {
            dest.drain(q + 1..p + 4);
        } else {
            dest.drain(q..p + 4);
        }
    }

    /* eliminate trailing "/." and "/.." */

    if let Some(p) = dest.iter().rposition(|&c| c == b'/') {
        if dest[p + 1..] == *b"." {
            dest.truncate(p + 1);
        } else if dest[p + 1..] == *b".." {
            if p == 0 {
                /* refuse to delete the leading slash */
                return None;
            }

            dest.truncate(p);

            match dest.iter().rposition(|&c| c == b'/') {
                Some(p) => dest.truncate(p + 1),
                /* if the string doesn't start with a slash, then an
                   empty return value is allowed */
                None => return Some(Cow::Owned(String::new())),
            }
        }
    }

    if dest == b"." {
        return Some(Cow::Owned(String::new()));
    }

    // the edits above only remove whole ASCII sequences
    Some(Cow::Owned(String::from_utf8(dest).ok()?))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress(uri: &str) -> Option<String> {
        uri_compress(uri).map(|s| s.into_owned())
    }

    #[test]
    fn test_compress() {
        assert_eq!(compress("/foo/bar").as_deref(), Some("/foo/bar"));
        assert_eq!(compress("/foo/./bar").as_deref(), Some("/foo/bar"));
        assert_eq!(compress("/./foo/bar").as_deref(), Some("/foo/bar"));
        assert_eq!(compress("/foo/bar/./").as_deref(), Some("/foo/bar/"));
        assert_eq!(compress("./foo/bar/").as_deref(), Some("foo/bar/"));
        assert_eq!(compress("/foo//bar/").as_deref(), Some("/foo/bar/"));
        assert_eq!(compress("/foo///bar/").as_deref(), Some("/foo/bar/"));
        assert_eq!(compress("/1/2/../3/").as_deref(), Some("/1/3/"));
        assert_eq!(compress("/1/2/../../3/").as_deref(), Some("/3/"));
        assert_eq!(compress("foo/../bar").as_deref(), Some("bar"));
        assert_eq!(compress("foo//../bar").as_deref(), Some("bar"));
        assert_eq!(compress("foo/..").as_deref(), Some(""));
        assert_eq!(compress("foo/.").as_deref(), Some("foo/"));
        assert_eq!(compress("foo/../.").as_deref(), Some(""));
        assert_eq!(compress(".").as_deref(), Some(""));

        assert_eq!(compress("/1/2/../../../3/"), None);
        assert_eq!(compress("/../"), None);
        assert_eq!(compress("/a/../../"), None);
        assert_eq!(compress("/.."), None);
        assert_eq!(compress(".."), None);
        assert_eq!(compress("/1/2/..").as_deref(), Some("/1/"));
        assert_eq!(compress("/foo/bar/..").as_deref(), Some("/foo/"));
    }

    #[test]
    fn canonical_input_is_borrowed() {
        assert!(matches!(
            uri_compress("/foo/bar").unwrap(),
            Cow::Borrowed(_)
        ));
        assert!(matches!(uri_compress("/").unwrap(), Cow::Borrowed(_)));
    }
}
