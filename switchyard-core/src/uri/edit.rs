//! Splicing query strings and argument lists into URIs.

/// Insert a query string into the URI.  If the URI already has one,
/// the new query string is prepended, separated by `&`.
pub fn uri_insert_query_string(uri: &str, query_string: &str) -> String {
    match uri.find('?') {
        Some(qmark) => format!(
            "{}{query_string}&{}",
            &uri[..qmark + 1],
            &uri[qmark + 1..]
        ),
        None => format!("{uri}?{query_string}"),
    }
}

/// Insert `;args` plus a path-info suffix right before the query
/// string (or at the end if there is none).
pub fn uri_insert_args(uri: &str, args: &str, path: &str) -> String {
    let q = uri.find('?').unwrap_or(uri.len());

    format!("{};{args}{path}{}", &uri[..q], &uri[q..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_query_string() {
        assert_eq!(uri_insert_query_string("/a", "x=1"), "/a?x=1");
        assert_eq!(uri_insert_query_string("/a?y=2", "x=1"), "/a?x=1&y=2");
    }

    #[test]
    fn test_insert_args() {
        assert_eq!(uri_insert_args("/a/b", "k=v", ""), "/a/b;k=v");
        assert_eq!(uri_insert_args("/a/b?q", "k=v", "/tail"), "/a/b;k=v/tail?q");
    }
}
