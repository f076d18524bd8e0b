//! The resource-address model: a typed sum of backend descriptions
//! produced by the translation server, plus the algebra used by the
//! cache and the URL rewriter.

pub mod cgi;
pub mod file;
pub mod http;
pub mod lhttp;
pub mod list;

use thiserror::Error;

pub use cgi::CgiAddress;
pub use file::FileAddress;
pub use http::HttpAddress;
pub use lhttp::LhttpAddress;
pub use list::{AddressList, ResolvedAddress};

use crate::hash::StringWithHash;
use crate::uri::base::base_tail;
use crate::uri::extract::uri_query_string;
use crate::uri::verify::{normalize_uri_path, uri_path_verify_paranoid};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("{0}")]
    Malformed(&'static str),

    /// The cache saw a URI that does not fit the provided base;
    /// surfaced as `502 Bad Gateway`.
    #[error("base mismatch")]
    BaseMismatch,

    /// A path failed normalization or the paranoid check; surfaced as
    /// `400 Bad Request`.
    #[error("malformed URI")]
    MalformedUri,
}

/// The tagged sum of all backend descriptions.  All transformations
/// produce new instances; a value is immutable after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResourceAddress {
    /// No address yet; never produced by a successful translation.
    #[default]
    None,

    /// A local static file.
    Local(FileAddress),

    /// A remote HTTP server.
    Http(HttpAddress),

    /// A locally spawned HTTP-over-AF_LOCAL server.
    Lhttp(LhttpAddress),

    /// A filter program reading the body on stdin.
    Pipe(CgiAddress),

    /// Classic CGI, one process per request.
    Cgi(CgiAddress),

    Fastcgi(CgiAddress),

    Was(CgiAddress),
}

impl ResourceAddress {
    pub fn is_defined(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// The CGI payload, if this is a CGI-family variant.
    pub fn cgi(&self) -> Option<&CgiAddress> {
        match self {
            Self::Pipe(cgi) | Self::Cgi(cgi) | Self::Fastcgi(cgi) | Self::Was(cgi) => Some(cgi),
            _ => None,
        }
    }

    fn rebuild_cgi(&self, cgi: CgiAddress) -> Self {
        match self {
            Self::Pipe(_) => Self::Pipe(cgi),
            Self::Cgi(_) => Self::Cgi(cgi),
            Self::Fastcgi(_) => Self::Fastcgi(cgi),
            Self::Was(_) => Self::Was(cgi),
            _ => unreachable!("rebuild_cgi() on a non-CGI address"),
        }
    }

    /// Replace the URI path.  Only defined for the path-bearing
    /// variants.
    pub fn with_path(&self, path: &str) -> Self {
        match self {
            Self::Http(http) => Self::Http(http.with_path(path)),
            Self::Lhttp(lhttp) => Self::Lhttp(lhttp.with_uri(path)),
            _ => unreachable!("with_path() on an address without a URI path"),
        }
    }

    /// Copy the query string from the given request URI into this
    /// address.
    pub fn with_query_string_from(&self, uri: &str) -> Self {
        let Some(query_string) = uri_query_string(uri) else {
            /* no query string in URI */
            return self.clone();
        };

        match self {
            Self::None | Self::Local(_) | Self::Pipe(_) => {
                /* no query string support */
                self.clone()
            }

            Self::Http(http) => Self::Http(http.insert_query_string(query_string)),

            Self::Lhttp(lhttp) => Self::Lhttp(lhttp.insert_query_string(query_string)),

            Self::Cgi(_) | Self::Fastcgi(_) | Self::Was(_) => {
                let mut cgi = self.cgi().expect("CGI-family address").clone();
                cgi.insert_query_string(query_string);
                self.rebuild_cgi(cgi)
            }
        }
    }

    /// Insert `";args/path"` into the URI portion.
    pub fn with_args(&self, args: &str, path: &str) -> Self {
        match self {
            Self::None | Self::Local(_) | Self::Pipe(_) => {
                /* no arguments support */
                self.clone()
            }

            Self::Http(http) => Self::Http(http.insert_args(args, path)),

            Self::Lhttp(lhttp) => Self::Lhttp(lhttp.insert_args(args, path)),

            Self::Cgi(_) | Self::Fastcgi(_) | Self::Was(_) => {
                let cgi = self.cgi().expect("CGI-family address");
                if cgi.uri.is_none() && cgi.path_info.is_none() {
                    return self.clone();
                }

                let mut cgi = cgi.clone();
                cgi.insert_args(args, path);
                self.rebuild_cgi(cgi)
            }
        }
    }

    /// Derive a base URI from the request URI.  Only defined for the
    /// CGI family.
    pub fn auto_base(&self, uri: &str) -> Option<String> {
        self.cgi().and_then(|cgi| cgi.auto_base(uri))
    }

    /// Return a copy with `suffix` stripped from whichever field
    /// holds it, or `None` if no variant-appropriate field ends with
    /// the (unescaped) suffix.
    pub fn save_base(&self, suffix: &str) -> Option<Self> {
        match self {
            Self::None | Self::Pipe(_) => None,

            Self::Cgi(_) | Self::Fastcgi(_) | Self::Was(_) => self
                .cgi()
                .expect("CGI-family address")
                .save_base(suffix)
                .map(|cgi| self.rebuild_cgi(cgi)),

            Self::Local(file) => file.save_base(suffix).map(Self::Local),

            Self::Http(http) => http.save_base(suffix).map(Self::Http),

            Self::Lhttp(lhttp) => lhttp.save_base(suffix).map(Self::Lhttp),
        }
    }

    /// Inverse of `save_base()`: append the unescaped suffix to the
    /// base-holding field.
    pub fn load_base(&self, suffix: &str) -> Option<Self> {
        match self {
            Self::None | Self::Pipe(_) => unreachable!("load_base() on an unsupported address"),

            Self::Cgi(_) | Self::Fastcgi(_) | Self::Was(_) => self
                .cgi()
                .expect("CGI-family address")
                .load_base(suffix)
                .map(|cgi| self.rebuild_cgi(cgi)),

            Self::Local(file) => file.load_base(suffix).map(Self::Local),

            Self::Http(http) => http.load_base(suffix).map(Self::Http),

            Self::Lhttp(lhttp) => lhttp.load_base(suffix).map(Self::Lhttp),
        }
    }

    fn post_cache_store(mut self) -> Self {
        if let Self::Cgi(cgi) | Self::Fastcgi(cgi) | Self::Was(cgi) = &mut self {
            cgi.post_cache_store();
        }
        self
    }

    /// Build the address to store in the cache.  With a `base`, only
    /// the base portion of `src` is stored; a request URI that does
    /// not fit the base is a `BaseMismatch`.
    pub fn cache_store(
        src: &Self,
        uri: &str,
        base: Option<&str>,
        easy_base: bool,
        expandable: bool,
    ) -> Result<Self, AddressError> {
        let Some(base) = base else {
            return Ok(src.clone().post_cache_store());
        };

        if let Some(tail) = base_tail(uri, base) {
            /* we received a valid BASE packet - store only the base
               URI */

            if easy_base || expandable {
                /* when the response is expandable, skip appending the
                   tail URI, don't call save_base() */
                return Ok(src.clone().post_cache_store());
            }

            if !src.is_defined() {
                /* save_base() would fail on a "None" address, but in
                   this case the operation is useful and is allowed as
                   a special case */
                return Ok(Self::None);
            }

            if let Some(dest) = src.save_base(tail) {
                return Ok(dest.post_cache_store());
            }

            /* the tail could not be applied to the address, so this
               is a base mismatch */
        }

        Err(AddressError::BaseMismatch)
    }

    /// Re-derive a request-specific address from a cached one.
    pub fn cache_load(
        src: &Self,
        uri: &str,
        base: Option<&str>,
        unsafe_base: bool,
        expandable: bool,
    ) -> Result<Self, AddressError> {
        if let Some(base) = base
            && !expandable
        {
            let tail = base_tail(uri, base).ok_or(AddressError::BaseMismatch)?;

            /* strip leading slashes before normalizing the URI;
               merging adjacent slashes is part of normalization, but
               the tail already comes after a slash */
            let tail = tail.trim_start_matches('/');

            let tail = normalize_uri_path(tail);

            if !unsafe_base && !uri_path_verify_paranoid(&tail) {
                return Err(AddressError::MalformedUri);
            }

            if !src.is_defined() {
                return Ok(Self::None);
            }

            if let Some(dest) = src.load_base(&tail) {
                return Ok(dest);
            }
        }

        Ok(src.clone())
    }

    /// Apply RFC 3986 relative resolution to the URI-holding field.
    pub fn apply(&self, relative: &str) -> Option<Self> {
        if relative.is_empty() {
            return Some(self.clone());
        }

        match self {
            Self::None => None,

            Self::Local(_) | Self::Pipe(_) => Some(self.clone()),

            Self::Http(http) => http.apply(relative).map(Self::Http),

            Self::Lhttp(lhttp) => lhttp.apply(relative).map(Self::Lhttp),

            Self::Cgi(_) | Self::Fastcgi(_) | Self::Was(_) => self
                .cgi()
                .expect("CGI-family address")
                .apply(relative)
                .map(|cgi| self.rebuild_cgi(cgi)),
        }
    }

    /// Compute the relative reference of this address against `base`.
    /// Empty result when the two differ in scheme/host.
    pub fn relative_to(&self, base: &Self) -> Option<String> {
        match (self, base) {
            (Self::None, _) | (Self::Local(_), _) | (Self::Pipe(_), _) => None,

            (Self::Http(http), Self::Http(base)) => {
                http.relative_to(base).map(str::to_owned)
            }

            (Self::Lhttp(lhttp), Self::Lhttp(base)) => {
                lhttp.relative_to(base).map(str::to_owned)
            }

            (Self::Cgi(cgi), _) | (Self::Fastcgi(cgi), _) | (Self::Was(cgi), _) => {
                base.cgi().and_then(|b| cgi.relative_to(b)).map(str::to_owned)
            }

            _ => None,
        }
    }

    /// Like `relative_to()`, but first apply `relative` to
    /// `apply_base`.
    pub fn relative_to_applied(&self, apply_base: &Self, relative: &str) -> Option<String> {
        match (self, apply_base) {
            (Self::Lhttp(lhttp), Self::Lhttp(base)) => {
                lhttp.relative_to_applied(base, relative)
            }

            (Self::Cgi(cgi), _) | (Self::Fastcgi(cgi), _) | (Self::Was(cgi), _) => {
                apply_base.cgi().and_then(|b| cgi.relative_to_applied(b, relative))
            }

            _ => apply_base.apply(relative)?.relative_to(self),
        }
    }

    /// A stable `(string, hash)` identifying this address for cache
    /// keying.
    pub fn id(&self) -> StringWithHash {
        match self {
            Self::None => StringWithHash::with_hash(String::new(), 0),

            Self::Local(file) => StringWithHash::new(file.path.clone()),

            Self::Http(http) => StringWithHash::new(http.get_absolute_uri()),

            Self::Lhttp(lhttp) => lhttp.id(),

            Self::Pipe(cgi) | Self::Cgi(cgi) | Self::Fastcgi(cgi) | Self::Was(cgi) => cgi.id(),
        }
    }

    /// The local file path, for `Local` addresses.
    pub fn file_path(&self) -> Option<&str> {
        match self {
            Self::Local(file) => Some(&file.path),
            _ => None,
        }
    }

    /// The file or executable path behind this address, if any.
    pub fn file_or_executable_path(&self) -> Option<&str> {
        match self {
            Self::None | Self::Http(_) | Self::Pipe(_) => None,

            Self::Cgi(cgi) | Self::Fastcgi(cgi) | Self::Was(cgi) => Some(&cgi.path),

            Self::Lhttp(lhttp) => Some(&lhttp.path),

            Self::Local(file) => Some(&file.path),
        }
    }

    pub fn host_and_port(&self) -> Option<&str> {
        match self {
            Self::Http(http) => http.host_and_port.as_deref(),
            Self::Lhttp(lhttp) => lhttp.host_and_port.as_deref(),
            _ => None,
        }
    }

    /// The URI path of this address, if it has one.
    pub fn uri_path(&self) -> Option<&str> {
        match self {
            Self::None | Self::Local(_) | Self::Pipe(_) => None,

            Self::Http(http) => Some(&http.path),

            Self::Lhttp(lhttp) => Some(&lhttp.uri),

            Self::Cgi(cgi) | Self::Fastcgi(cgi) | Self::Was(cgi) => match &cgi.uri {
                Some(uri) => Some(uri),
                None => cgi.script_name.as_deref(),
            },
        }
    }

    /// Validate the address after translation-response assembly.
    pub fn check(&self) -> Result<(), AddressError> {
        match self {
            Self::None => Ok(()),

            Self::Http(http) => http.check(),

            Self::Local(_) => Ok(()),

            Self::Lhttp(lhttp) => lhttp.check(),

            Self::Pipe(cgi) | Self::Cgi(cgi) | Self::Fastcgi(cgi) => cgi.check(false),

            Self::Was(cgi) => cgi.check(true),
        }
    }

    pub fn is_valid_base(&self) -> bool {
        match self {
            Self::None => true,
            Self::Local(file) => file.is_valid_base(),
            Self::Http(http) => http.is_valid_base(),
            Self::Lhttp(lhttp) => lhttp.is_valid_base(),
            Self::Pipe(cgi) | Self::Cgi(cgi) | Self::Fastcgi(cgi) | Self::Was(cgi) => {
                cgi.is_valid_base()
            }
        }
    }

    pub fn has_query_string(&self) -> bool {
        match self {
            Self::None => false,
            Self::Local(file) => file.has_query_string(),
            Self::Http(http) => http.has_query_string(),
            Self::Lhttp(lhttp) => lhttp.has_query_string(),
            Self::Pipe(cgi) | Self::Cgi(cgi) | Self::Fastcgi(cgi) | Self::Was(cgi) => {
                cgi.has_query_string()
            }
        }
    }

    pub fn is_expandable(&self) -> bool {
        match self {
            Self::None => false,
            Self::Local(file) => file.is_expandable(),
            Self::Http(http) => http.is_expandable(),
            Self::Lhttp(lhttp) => lhttp.is_expandable(),
            Self::Pipe(cgi) | Self::Cgi(cgi) | Self::Fastcgi(cgi) | Self::Was(cgi) => {
                cgi.is_expandable()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cgi_address() -> ResourceAddress {
        let mut cgi = CgiAddress::new("/usr/lib/cgi-bin/app.cgi");
        cgi.script_name = Some("/app/".to_owned());
        cgi.path_info = Some("sub/page".to_owned());
        ResourceAddress::Fastcgi(cgi)
    }

    #[test]
    fn cache_store_without_base_copies() {
        let src = cgi_address();
        let stored = ResourceAddress::cache_store(&src, "/app/sub/page", None, false, false)
            .expect("store");
        assert_eq!(stored.id().value, src.id().value);
    }

    #[test]
    fn cache_store_strips_tail() {
        let src = cgi_address();
        let stored =
            ResourceAddress::cache_store(&src, "/app/sub/page", Some("/app/"), false, false)
                .expect("store");

        let cgi = stored.cgi().expect("CGI address");
        assert_eq!(cgi.get_path_info(), "");
    }

    #[test]
    fn cache_store_base_mismatch() {
        let src = cgi_address();
        assert_eq!(
            ResourceAddress::cache_store(&src, "/b/x", Some("/a/"), false, false),
            Err(AddressError::BaseMismatch)
        );
    }

    #[test]
    fn cache_store_easy_base_copies() {
        let src = cgi_address();
        let stored =
            ResourceAddress::cache_store(&src, "/app/sub/page", Some("/app/"), true, false)
                .expect("store");
        assert_eq!(stored.id().value, src.id().value);
    }

    #[test]
    fn cache_store_none_source() {
        let stored = ResourceAddress::cache_store(
            &ResourceAddress::None,
            "/app/x",
            Some("/app/"),
            false,
            false,
        )
        .expect("store");
        assert!(!stored.is_defined());
    }

    #[test]
    fn cache_load_appends_tail() {
        let src = cgi_address();
        let stored =
            ResourceAddress::cache_store(&src, "/app/sub/page", Some("/app/"), false, false)
                .expect("store");

        let loaded =
            ResourceAddress::cache_load(&stored, "/app/sub/page", Some("/app/"), false, false)
                .expect("load");
        assert_eq!(loaded.id().value, src.id().value);
        assert_eq!(loaded.id().hash, src.id().hash);
    }

    #[test]
    fn cache_load_rejects_dot_dot() {
        let stored = cgi_address();
        assert_eq!(
            ResourceAddress::cache_load(&stored, "/app/../etc", Some("/app/"), false, false),
            Err(AddressError::MalformedUri)
        );
    }

    #[test]
    fn cache_load_unsafe_base_skips_check() {
        let src = cgi_address();
        let stored =
            ResourceAddress::cache_store(&src, "/app/sub/page", Some("/app/"), false, false)
                .expect("store");

        assert!(
            ResourceAddress::cache_load(&stored, "/app/../x", Some("/app/"), true, false).is_ok()
        );
    }

    #[test]
    fn apply_is_identity_for_files() {
        let file = ResourceAddress::Local(FileAddress::new("/var/www/x.html"));
        let applied = file.apply("anything").expect("apply");
        assert_eq!(applied, file);

        assert!(ResourceAddress::None.apply("x").is_none());
    }

    #[test]
    fn id_distinguishes_variants() {
        let cgi = cgi_address();
        let file = ResourceAddress::Local(FileAddress::new("/var/www/x.html"));
        assert_ne!(cgi.id().value, file.id().value);
        assert_eq!(ResourceAddress::None.id().value, "");
    }

    #[test]
    fn was_check_enforced_through_enum() {
        use crate::address::list::ResolvedAddress;

        let mut cgi = CgiAddress::new("/usr/lib/was/app");
        cgi.address_list
            .push(ResolvedAddress::Local("/run/app.was".to_owned()));
        cgi.concurrency = 0;

        let was = ResourceAddress::Was(cgi.clone());
        assert!(was.check().is_err());

        cgi.concurrency = 4;
        let was = ResourceAddress::Was(cgi);
        assert!(was.check().is_ok());
    }
}
