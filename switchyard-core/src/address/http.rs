//! Addresses of remote HTTP servers.

use super::AddressError;
use super::list::AddressList;
use crate::uri::base::{base_string, is_base};
use crate::uri::edit::{uri_insert_args, uri_insert_query_string};
use crate::uri::extract::uri_has_scheme;
use crate::uri::relative::{uri_absolute, uri_relative};
use crate::uri::verify::uri_path_verify_quick;

/// The address of a resource on a remote HTTP server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpAddress {
    pub ssl: bool,
    pub http2: bool,

    pub certificate: Option<String>,

    /// The host part of the URI (including the port, if any); `None`
    /// when the server is reached over an `AF_LOCAL` socket.
    pub host_and_port: Option<String>,

    /// The path component of the URI, starting with a slash.
    pub path: String,

    pub addresses: AddressList,

    pub expand_path: bool,
}

impl HttpAddress {
    pub fn new(ssl: bool, host_and_port: Option<String>, path: String) -> Self {
        Self {
            ssl,
            host_and_port,
            path,
            ..Default::default()
        }
    }

    /// Parse an absolute `http://`, `https://` or `unix:/` URI.
    pub fn parse(uri: &str) -> Result<Self, AddressError> {
        if let Some(rest) = uri.strip_prefix("http://") {
            Self::parse2(false, rest)
        } else if let Some(rest) = uri.strip_prefix("https://") {
            Self::parse2(true, rest)
        } else if let Some(rest) = uri.strip_prefix("unix:/") {
            /* rewind to the slash */
            let _ = rest;
            Ok(Self::new(false, None, uri["unix:".len()..].to_owned()))
        } else {
            Err(AddressError::Malformed("unrecognized URI"))
        }
    }

    fn parse2(ssl: bool, uri: &str) -> Result<Self, AddressError> {
        match uri.find('/') {
            Some(0) => Err(AddressError::Malformed("malformed HTTP URI")),
            Some(slash) => {
                let path = &uri[slash..];
                if !uri_path_verify_quick(path) {
                    return Err(AddressError::Malformed("malformed HTTP URI"));
                }

                Ok(Self::new(ssl, Some(uri[..slash].to_owned()), path.to_owned()))
            }
            None => Ok(Self::new(ssl, Some(uri.to_owned()), "/".to_owned())),
        }
    }

    pub fn check(&self) -> Result<(), AddressError> {
        if self.addresses.is_empty() && self.host_and_port.is_none() {
            return Err(AddressError::Malformed("no ADDRESS for HTTP address"));
        }

        Ok(())
    }

    pub fn with_path(&self, path: &str) -> Self {
        let mut dest = self.clone();
        dest.path = path.to_owned();
        dest
    }

    pub fn get_absolute_uri(&self) -> String {
        self.get_absolute_uri_with_path(&self.path)
    }

    pub fn get_absolute_uri_with_path(&self, override_path: &str) -> String {
        match &self.host_and_port {
            Some(host_and_port) => format!("http://{host_and_port}{override_path}"),
            None => format!("unix:{override_path}"),
        }
    }

    pub fn has_query_string(&self) -> bool {
        self.path.contains('?')
    }

    pub fn insert_query_string(&self, query_string: &str) -> Self {
        self.with_path(&uri_insert_query_string(&self.path, query_string))
    }

    pub fn insert_args(&self, args: &str, path_info: &str) -> Self {
        self.with_path(&uri_insert_args(&self.path, args, path_info))
    }

    pub fn is_expandable(&self) -> bool {
        self.expand_path
    }

    pub fn is_valid_base(&self) -> bool {
        self.is_expandable() || is_base(&self.path)
    }

    pub fn save_base(&self, suffix: &str) -> Option<Self> {
        let length = base_string(&self.path, suffix)?;
        Some(self.with_path(&self.path[..length]))
    }

    pub fn load_base(&self, suffix: &str) -> Option<Self> {
        debug_assert!(self.expand_path || self.path.ends_with('/'));

        Some(self.with_path(&format!("{}{suffix}", self.path)))
    }

    pub fn apply(&self, relative: &str) -> Option<Self> {
        if uri_has_scheme(relative) {
            let mut other = Self::parse(relative).ok()?;

            let my_host = self.host_and_port.as_deref().unwrap_or("");
            let other_host = other.host_and_port.as_deref().unwrap_or("");

            if my_host != other_host {
                /* if it points to a different host, we cannot apply
                   the address list, and so this function must fail */
                return None;
            }

            other.addresses = self.addresses.clone();
            return Some(other);
        }

        Some(self.with_path(&uri_absolute(&self.path, relative)))
    }

    pub fn relative_to(&self, base: &Self) -> Option<&str> {
        let my_host = self.host_and_port.as_deref().unwrap_or("");
        let base_host = base.host_and_port.as_deref().unwrap_or("");

        if my_host != base_host {
            return None;
        }

        uri_relative(&base.path, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_variants() {
        let a = HttpAddress::parse("http://host:8080/x/y").unwrap();
        assert!(!a.ssl);
        assert_eq!(a.host_and_port.as_deref(), Some("host:8080"));
        assert_eq!(a.path, "/x/y");

        let b = HttpAddress::parse("https://host").unwrap();
        assert!(b.ssl);
        assert_eq!(b.path, "/");

        let c = HttpAddress::parse("unix:/run/app.socket").unwrap();
        assert_eq!(c.host_and_port, None);
        assert_eq!(c.path, "/run/app.socket");

        assert!(HttpAddress::parse("ftp://host/").is_err());
    }

    #[test]
    fn save_load_round_trip() {
        let a = HttpAddress::parse("http://host/app/sub/page").unwrap();
        let saved = a.save_base("sub/page").unwrap();
        assert_eq!(saved.path, "/app/");

        let loaded = saved.load_base("sub/page").unwrap();
        assert_eq!(loaded.path, "/app/sub/page");
    }

    #[test]
    fn apply_same_host_keeps_addresses() {
        let a = HttpAddress::parse("http://host/app/").unwrap();
        let applied = a.apply("http://host/other").unwrap();
        assert_eq!(applied.path, "/other");

        assert!(a.apply("http://elsewhere/x").is_none());
    }

    #[test]
    fn relative_to_requires_same_host() {
        let base = HttpAddress::parse("http://host/app/").unwrap();
        let a = HttpAddress::parse("http://host/app/x").unwrap();
        assert_eq!(a.relative_to(&base), Some("x"));

        let other = HttpAddress::parse("http://other/app/x").unwrap();
        assert_eq!(other.relative_to(&base), None);
    }
}
