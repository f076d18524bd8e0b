//! Addresses of "Local HTTP" servers: HTTP/1.1 spoken over a private
//! `AF_LOCAL` socket to a locally spawned process.

use super::AddressError;
use crate::hash::{StringWithHash, djb_hash};
use crate::spawn::child_options::ChildOptions;
use crate::spawn::prepared::PreparedChildProcess;
use crate::uri::base::{base_string, is_base};
use crate::uri::edit::{uri_insert_args, uri_insert_query_string};
use crate::uri::extract::uri_has_authority;
use crate::uri::relative::{uri_absolute, uri_relative};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LhttpAddress {
    /// Absolute path of the executable.
    pub path: String,

    /// Command-line arguments.
    pub args: Vec<String>,

    pub options: ChildOptions,

    /// The value of the `Host` request header to be sent to the
    /// child.
    pub host_and_port: Option<String>,

    /// The request URI.
    pub uri: String,

    /// The maximum number of parallel child processes of this kind.
    pub parallelism: u32,

    /// The maximum number of concurrent connections to one instance.
    pub concurrency: u32,

    /// A blocking listener socket for the child?
    pub blocking: bool,

    pub expand_uri: bool,
}

impl LhttpAddress {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            concurrency: 1,
            ..Default::default()
        }
    }

    /// The identity of the server process: everything that decides
    /// whether two requests may share a child, and nothing else.
    /// This is the stock key.
    pub fn server_id(&self) -> StringWithHash {
        let mut b = String::new();
        b.push_str(&self.path);

        let mut options_id = String::new();
        self.options.make_id(&mut options_id);
        b.push_str(&options_id);

        for i in &self.args {
            b.push('!');
            b.push_str(i);
        }

        StringWithHash::new(b)
    }

    /// The full identity for cache keying: the server id plus the
    /// host header and request URI.
    pub fn id(&self) -> StringWithHash {
        let server_id = self.server_id();
        let mut b = server_id.value;
        let mut hash = server_id.hash;

        if let Some(host_and_port) = &self.host_and_port {
            b.push_str(";h=");
            b.push_str(host_and_port);
            hash = djb_hash(host_and_port.as_bytes(), hash);
        }

        b.push_str(";u=");
        b.push_str(&self.uri);
        hash = djb_hash(self.uri.as_bytes(), hash);

        StringWithHash::with_hash(b, hash)
    }

    pub fn check(&self) -> Result<(), AddressError> {
        if self.uri.is_empty() {
            return Err(AddressError::Malformed("missing LHTTP_URI"));
        }

        Ok(())
    }

    pub fn is_same_program(&self, other: &Self) -> bool {
        self.path == other.path
    }

    pub fn with_uri(&self, new_uri: &str) -> Self {
        let mut dest = self.clone();
        dest.uri = new_uri.to_owned();
        dest
    }

    pub fn has_query_string(&self) -> bool {
        self.uri.contains('?')
    }

    pub fn insert_query_string(&self, query_string: &str) -> Self {
        self.with_uri(&uri_insert_query_string(&self.uri, query_string))
    }

    pub fn insert_args(&self, new_args: &str, path_info: &str) -> Self {
        self.with_uri(&uri_insert_args(&self.uri, new_args, path_info))
    }

    pub fn is_expandable(&self) -> bool {
        self.expand_uri
    }

    pub fn is_valid_base(&self) -> bool {
        self.is_expandable() || is_base(&self.uri)
    }

    pub fn save_base(&self, suffix: &str) -> Option<Self> {
        let length = base_string(&self.uri, suffix)?;
        Some(self.with_uri(&self.uri[..length]))
    }

    pub fn load_base(&self, suffix: &str) -> Option<Self> {
        debug_assert!(self.uri.ends_with('/'));

        Some(self.with_uri(&format!("{}{suffix}", self.uri)))
    }

    pub fn apply(&self, relative: &str) -> Option<Self> {
        let new_uri = apply_uri(&self.uri, relative)?;
        Some(self.with_uri(&new_uri))
    }

    pub fn relative_to(&self, base: &Self) -> Option<&str> {
        if !self.is_same_program(base) {
            return None;
        }

        uri_relative(&base.uri, &self.uri)
    }

    pub fn relative_to_applied(&self, apply_base: &Self, relative: &str) -> Option<String> {
        if !self.is_same_program(apply_base) {
            return None;
        }

        apply_uri(&apply_base.uri, relative)
    }

    /// Copy the executable and its arguments into the spawn
    /// parameters.
    pub fn copy_to(&self, dest: &mut PreparedChildProcess) -> std::io::Result<()> {
        dest.append(&self.path);

        for i in &self.args {
            dest.append(i);
        }

        self.options.copy_to(dest)
    }
}

fn apply_uri(base_uri: &str, relative: &str) -> Option<String> {
    if relative.is_empty() {
        return Some(base_uri.to_owned());
    }

    if uri_has_authority(relative) {
        return None;
    }

    Some(uri_absolute(base_uri, relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LhttpAddress {
        let mut a = LhttpAddress::new("/usr/bin/app-server");
        a.uri = "/app/".to_owned();
        a
    }

    #[test]
    fn server_id_excludes_uri() {
        let a = sample();
        let b = a.with_uri("/app/other");
        assert_eq!(a.server_id(), b.server_id());
        assert_ne!(a.id().value, b.id().value);
    }

    #[test]
    fn id_includes_host() {
        let a = sample();
        let mut b = sample();
        b.host_and_port = Some("app.example:80".to_owned());
        assert_ne!(a.id().value, b.id().value);
    }

    #[test]
    fn save_load_round_trip() {
        let a = sample().with_uri("/app/sub/x");
        let saved = a.save_base("sub/x").unwrap();
        assert_eq!(saved.uri, "/app/");

        let loaded = saved.load_base("sub/x").unwrap();
        assert_eq!(loaded.id().value, a.id().value);
    }

    #[test]
    fn check_requires_uri() {
        let mut a = sample();
        a.uri.clear();
        assert!(a.check().is_err());
        assert!(sample().check().is_ok());
    }

    #[test]
    fn apply_rejects_authority() {
        let a = sample();
        assert_eq!(a.apply("x").unwrap().uri, "/app/x");
        assert!(a.apply("//other.example/x").is_none());
    }
}
