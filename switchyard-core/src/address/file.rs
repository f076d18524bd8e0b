//! Addresses of local static files.

use crate::uri::escape::{find_unescaped_suffix, uri_unescape};

/// The address of a file served straight from the filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAddress {
    /// The path, or `"."` when the whole path lives in `base`.
    pub path: String,

    /// The base directory a cached entry appends its tail to.
    /// Always `/`-terminated when set.
    pub base: Option<String>,

    /// Path of a pre-deflated copy.
    pub deflated: Option<String>,

    /// Path of a pre-gzipped copy.
    pub gzipped: Option<String>,

    pub content_type: Option<String>,

    pub document_root: Option<String>,

    pub expand_path: bool,
    pub expand_document_root: bool,
}

impl FileAddress {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            ..Default::default()
        }
    }

    pub fn is_expandable(&self) -> bool {
        self.expand_path || self.expand_document_root
    }

    pub fn is_valid_base(&self) -> bool {
        self.is_expandable() || self.base.is_some()
    }

    pub fn save_base(&self, suffix: &str) -> Option<FileAddress> {
        if self.base.is_some() && suffix.is_empty() {
            return (self.path == ".").then(|| self.clone());
        }

        let end = find_unescaped_suffix(&self.path, suffix)?;

        if self.base.is_some() && end == 0 {
            let mut dest = self.clone();
            dest.path = ".".to_owned();
            return Some(dest);
        }

        let mut dest = self.clone();
        dest.base = Some(self.path[..end].to_owned());
        dest.path = ".".to_owned();

        /* BASE+DEFLATED is not supported */
        dest.deflated = None;
        dest.gzipped = None;

        Some(dest)
    }

    pub fn load_base(&self, suffix: &str) -> Option<FileAddress> {
        let src_base = match &self.base {
            Some(base) => base.as_str(),
            /* special case: an EASY_BASE response whose path is the
               base directory itself */
            None => self.path.as_str(),
        };

        let unescaped = uri_unescape(suffix)?;
        let new_path = if unescaped.is_empty() {
            ".".to_owned()
        } else {
            unescaped.trim_start_matches('/').to_owned()
        };

        let mut dest = self.clone();
        dest.base = Some(src_base.to_owned());
        dest.path = new_path;
        Some(dest)
    }

    pub fn has_query_string(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_base_splits_path() {
        let address = FileAddress::new("/var/www/foo/bar.html");
        let saved = address.save_base("foo/bar.html").unwrap();
        assert_eq!(saved.path, ".");
        assert_eq!(saved.base.as_deref(), Some("/var/www/"));
    }

    #[test]
    fn save_base_mismatch() {
        let address = FileAddress::new("/var/www/foo.html");
        assert!(address.save_base("bar.html").is_none());
    }

    #[test]
    fn save_base_drops_precompressed() {
        let mut address = FileAddress::new("/var/www/foo/bar.html");
        address.deflated = Some("/var/www/foo/bar.html.dfl".to_owned());
        let saved = address.save_base("bar.html").unwrap();
        assert_eq!(saved.deflated, None);
    }

    #[test]
    fn load_base_appends_tail() {
        let mut address = FileAddress::new(".");
        address.base = Some("/var/www/".to_owned());

        let loaded = address.load_base("foo/index.html").unwrap();
        assert_eq!(loaded.base.as_deref(), Some("/var/www/"));
        assert_eq!(loaded.path, "foo/index.html");
    }

    #[test]
    fn load_base_unescapes() {
        let mut address = FileAddress::new(".");
        address.base = Some("/var/www/".to_owned());

        let loaded = address.load_base("a%20b").unwrap();
        assert_eq!(loaded.path, "a b");

        assert!(address.load_base("a%zz").is_none());
    }

    #[test]
    fn save_then_load_round_trip() {
        let address = FileAddress::new("/var/www/sub/dir/x.txt");
        let saved = address.save_base("sub/dir/x.txt").unwrap();
        let loaded = saved.load_base("sub/dir/x.txt").unwrap();
        assert_eq!(loaded.base.as_deref(), Some("/var/www/"));
        assert_eq!(loaded.path, "sub/dir/x.txt");
    }
}
