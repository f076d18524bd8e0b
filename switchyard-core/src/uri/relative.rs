//! Relative URI reference resolution and its inverse.

use super::extract::{uri_after_scheme, uri_has_scheme, uri_path_query};

/// The position right after the last slash of the path of `uri`, or
/// `None` if the URI has no path.
fn uri_after_last_slash(uri: &str) -> Option<usize> {
    let path = uri_path_query(uri)?;
    let offset = uri.len() - path.len();
    path.rfind('/').map(|i| offset + i + 1)
}

/// Resolve a (possibly relative) URI reference against a base URI,
/// RFC 3986 style.  Handles scheme-absolute references, protocol
/// relative `//authority`, absolute paths, query-only references and
/// path-relative references.
pub fn uri_absolute(base: &str, uri: &str) -> String {
    if uri.is_empty() {
        return base.to_owned();
    }

    if uri_has_scheme(uri) {
        return uri.to_owned();
    }

    let base_length = if uri.starts_with("//") {
        match base.find("://") {
            Some(colon) => colon + 1,
            None => 0,
        }
    } else if uri.starts_with('/') {
        if base.starts_with('/') && !base.starts_with("//") {
            return uri.to_owned();
        }

        match uri_path_query(base) {
            Some(path) => base.len() - path.len(),
            None => base.len(),
        }
    } else if uri.starts_with('?') {
        match base.find('?') {
            Some(qmark) => qmark,
            None => base.len(),
        }
    } else {
        match uri_after_last_slash(base) {
            Some(end) => end,
            None => return format!("{base}/{uri}"),
        }
    };

    format!("{}{uri}", &base[..base_length])
}

/// Check if an (absolute) URI is relative to a base URI (also
/// absolute), and return the relative part.  Returns `None` if the
/// two URIs do not match.
pub fn uri_relative<'a>(base: &str, uri: &'a str) -> Option<&'a str> {
    if base.is_empty() || uri.is_empty() {
        return None;
    }

    if let Some(rest) = uri.strip_prefix(base) {
        return Some(rest);
    }

    /* special case: http://hostname without trailing slash */
    if uri.len() == base.len() - 1
        && base.starts_with(uri)
        && base.ends_with('/')
        && uri_after_scheme(uri).is_some_and(|rest| !rest.contains('/'))
    {
        return Some("");
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute() {
        assert_eq!(uri_absolute("http://localhost/", "foo"), "http://localhost/foo");
        assert_eq!(uri_absolute("http://localhost/bar", "foo"), "http://localhost/foo");
        assert_eq!(uri_absolute("http://localhost/bar/", "foo"), "http://localhost/bar/foo");
        assert_eq!(uri_absolute("http://localhost/bar/", "/foo"), "http://localhost/foo");
        assert_eq!(
            uri_absolute("http://localhost/bar/", "http://localhost/bar/foo"),
            "http://localhost/bar/foo"
        );
        assert_eq!(
            uri_absolute("http://localhost/bar/", "http://localhost/foo"),
            "http://localhost/foo"
        );
        assert_eq!(uri_absolute("http://localhost", "foo"), "http://localhost/foo");
        assert_eq!(uri_absolute("/", "foo"), "/foo");
        assert_eq!(uri_absolute("/bar", "foo"), "/foo");
        assert_eq!(uri_absolute("/bar/", "foo"), "/bar/foo");
        assert_eq!(uri_absolute("/bar/", "/foo"), "/foo");
        assert_eq!(uri_absolute("/bar", "?foo"), "/bar?foo");

        assert_eq!(
            uri_absolute("http://localhost/foo/", "//example.com/bar"),
            "http://example.com/bar"
        );
        assert_eq!(
            uri_absolute("ftp://localhost/foo/", "//example.com/bar"),
            "ftp://example.com/bar"
        );
        assert_eq!(uri_absolute("/foo/", "//example.com/bar"), "//example.com/bar");
        assert_eq!(
            uri_absolute("//example.com/foo/", "bar"),
            "//example.com/foo/bar"
        );
        assert_eq!(uri_absolute("//example.com/foo/", "/bar"), "//example.com/bar");
        assert_eq!(uri_absolute("//example.com", "bar"), "//example.com/bar");
        assert_eq!(uri_absolute("//example.com", "/bar"), "//example.com/bar");
    }

    #[test]
    fn test_relative() {
        assert_eq!(uri_relative("", "/foo/"), None);
        assert_eq!(uri_relative("/foo/", ""), None);
        assert_eq!(uri_relative("/foo/", "/foo"), None);
        assert_eq!(uri_relative("/foo/", "/foo/"), Some(""));
        assert_eq!(uri_relative("/foo/", "/foo/bar"), Some("bar"));
        assert_eq!(uri_relative("/", "/foo/bar"), Some("foo/bar"));
        assert_eq!(
            uri_relative("http://host.name/foo/", "http://host.name/foo"),
            None
        );
        assert_eq!(uri_relative("http://host.name/", "http://host.name"), Some(""));
    }
}
