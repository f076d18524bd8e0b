//! Addresses of CGI-style backends (CGI, FastCGI, WAS, pipe).

use super::AddressError;
use super::list::AddressList;
use crate::hash::{StringWithHash, djb_hash, djb_hash_string};
use crate::spawn::child_options::ChildOptions;
use crate::uri::base::{base_string, is_base};
use crate::uri::escape::{find_unescaped_suffix, uri_unescape};
use crate::uri::extract::uri_has_authority;
use crate::uri::relative::{uri_absolute, uri_relative};

/// The address of a CGI/FastCGI/WAS request: an executable plus the
/// CGI parameter split of the request URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiAddress {
    /// Absolute path of the executable.
    pub path: String,

    /// Command-line arguments.
    pub args: Vec<String>,

    /// Protocol-specific name/value pairs (per-request).
    pub params: Vec<String>,

    pub options: ChildOptions,

    pub interpreter: Option<String>,
    pub action: Option<String>,

    pub uri: Option<String>,
    pub script_name: Option<String>,
    pub path_info: Option<String>,
    pub query_string: Option<String>,
    pub document_root: Option<String>,

    /// An optional list of addresses to connect to.  If given for a
    /// FastCGI/WAS resource, the pool connects to one of these
    /// instead of spawning a child process.
    pub address_list: AddressList,

    /// Cached result of `child_id()`, filled by `post_cache_store()`.
    pub cached_child_id: Option<StringWithHash>,

    /// The maximum number of parallel child processes of this kind.
    pub parallelism: u32,

    /// The maximum number of concurrent connections to one instance.
    /// Only applicable to WAS; non-zero selects the multiplexed
    /// protocol.
    pub concurrency: u32,

    /// Set for child processes which will likely be used only once.
    pub disposable: bool,

    /// Pass the CGI parameter "REQUEST_URI" verbatim instead of
    /// building it from SCRIPT_NAME, PATH_INFO and QUERY_STRING.
    pub request_uri_verbatim: bool,

    pub expand_path: bool,
    pub expand_uri: bool,
    pub expand_script_name: bool,
    pub expand_path_info: bool,
    pub expand_document_root: bool,
}

fn has_trailing_slash(p: &str) -> bool {
    p.ends_with('/')
}

impl CgiAddress {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            ..Default::default()
        }
    }

    pub fn get_path_info(&self) -> &str {
        self.path_info.as_deref().unwrap_or("")
    }

    /// Reassemble the request URI from SCRIPT_NAME, PATH_INFO and
    /// QUERY_STRING.
    pub fn get_uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return uri.clone();
        }

        let sn = self.script_name.as_deref().unwrap_or("/");

        let mut pi = self.get_path_info();
        let qs = self.query_string.as_deref();

        if pi.is_empty() && qs.is_none() {
            return sn.to_owned();
        }

        if pi.starts_with('/') && has_trailing_slash(sn) {
            /* avoid generating a double slash when concatenating
               script_name and path_info */
            pi = &pi[1..];
        }

        match qs {
            Some(qs) => format!("{sn}{pi}?{qs}"),
            None => format!("{sn}{pi}"),
        }
    }

    pub fn is_expandable(&self) -> bool {
        self.expand_path
            || self.expand_uri
            || self.expand_script_name
            || self.expand_path_info
            || self.expand_document_root
    }

    /// Is any field part of the child process identity expandable?
    fn is_child_expandable(&self) -> bool {
        self.expand_path
    }

    /// Cache the `child_id()` computation if its inputs are final.
    pub fn post_cache_store(&mut self) {
        if (self.action.is_some() || !self.expand_path) && !self.is_child_expandable() {
            self.cached_child_id = Some(self.compute_child_id());
        }
    }

    fn compute_child_id(&self) -> StringWithHash {
        let mut options_id = String::new();
        self.options.make_id(&mut options_id);

        let mut b = String::new();
        let mut hash = djb_hash_string(&options_id);

        let value = self.action.as_deref().unwrap_or(&self.path);
        b.push_str(value);
        hash = djb_hash(value.as_bytes(), hash);

        for i in &self.args {
            b.push('!');
            b.push_str(i);
            hash = djb_hash(i.as_bytes(), hash);
        }

        for i in &self.options.env {
            b.push('$');
            b.push_str(i);
            hash = djb_hash(i.as_bytes(), hash);
        }

        b.push_str(&options_id);

        StringWithHash::with_hash(b, hash)
    }

    /// The child process identity: two addresses with equal child ids
    /// may share a process pool.
    pub fn child_id(&self) -> StringWithHash {
        match &self.cached_child_id {
            Some(id) => id.clone(),
            None => self.compute_child_id(),
        }
    }

    /// The full per-request identity used for cache keying.  Starts
    /// with `child_id()` and appends the request-specific fields; the
    /// order of components is part of the key.
    pub fn id(&self) -> StringWithHash {
        let child_id = self.child_id();
        let mut b = child_id.value;
        let mut hash = child_id.hash;

        if self.action.is_some() {
            b.push_str(";p=");
            hash = djb_hash(self.path.as_bytes(), hash);
            b.push_str(&self.path);
        }

        if let Some(document_root) = &self.document_root {
            b.push_str(";d=");
            b.push_str(document_root);
        }

        if let Some(interpreter) = &self.interpreter {
            b.push_str(";i=");
            b.push_str(interpreter);
            hash = djb_hash(interpreter.as_bytes(), hash);
        }

        for i in &self.params {
            b.push('!');
            b.push_str(i);
            hash = djb_hash(i.as_bytes(), hash);
        }

        if let Some(uri) = &self.uri {
            b.push_str(";u=");
            b.push_str(uri);
            hash = djb_hash(uri.as_bytes(), hash);
        } else if let Some(script_name) = &self.script_name {
            b.push_str(";s=");
            b.push_str(script_name);
            hash = djb_hash(script_name.as_bytes(), hash);
        }

        if let Some(path_info) = &self.path_info {
            b.push_str(";p=");
            b.push_str(path_info);
            hash = djb_hash(path_info.as_bytes(), hash);
        }

        if let Some(query_string) = &self.query_string {
            b.push('?');
            b.push_str(query_string);
            hash = djb_hash(query_string.as_bytes(), hash);
        }

        StringWithHash::with_hash(b, hash)
    }

    /// Validate the address; `is_was` enables the WAS-specific
    /// checks.  The remote (multiplexed) WAS protocol is only
    /// specified over UNIX sockets, so a remote address list must be
    /// a single `AF_LOCAL` address; the check guards against
    /// misconfigured translation servers.
    pub fn check(&self, is_was: bool) -> Result<(), AddressError> {
        if is_was && !self.address_list.is_empty() {
            if self.concurrency == 0 {
                return Err(AddressError::Malformed("missing concurrency for Remote-WAS"));
            }

            if !self.address_list.is_single() {
                return Err(AddressError::Malformed("too many Remote-WAS addresses"));
            }

            if !self
                .address_list
                .front()
                .expect("non-empty address list")
                .is_local()
            {
                return Err(AddressError::Malformed("Remote-WAS requires AF_LOCAL"));
            }
        }

        Ok(())
    }

    pub fn is_same_program(&self, other: &Self) -> bool {
        self.path == other.path
    }

    pub fn insert_query_string(&mut self, new_query_string: &str) {
        self.query_string = Some(match &self.query_string {
            Some(old) => format!("{new_query_string}&{old}"),
            None => new_query_string.to_owned(),
        });
    }

    pub fn insert_args(&mut self, new_args: &str, new_path_info: &str) {
        if let Some(uri) = &self.uri {
            self.uri = Some(crate::uri::edit::uri_insert_args(
                uri,
                new_args,
                new_path_info,
            ));
        }

        if let Some(path_info) = &self.path_info {
            self.path_info = Some(format!("{path_info};{new_args}{new_path_info}"));
        }
    }

    pub fn is_valid_base(&self) -> bool {
        if self.is_expandable() {
            return true;
        }

        let pi = self.get_path_info();
        if pi.is_empty() {
            self.script_name.as_deref().is_some_and(is_base)
        } else {
            is_base(pi)
        }
    }

    /// Derive a base URI from the request URI: possible when
    /// SCRIPT_NAME ends with a slash or PATH_INFO starts with one,
    /// and the request URI ends with PATH_INFO.
    pub fn auto_base(&self, request_uri: &str) -> Option<String> {
        let mut pi = self.get_path_info();

        /* either SCRIPT_NAME must end with a slash or PATH_INFO must
           start with one */
        if !self.script_name.as_deref().is_some_and(is_base) {
            pi = pi.strip_prefix('/')?;
        }

        let length = base_string(request_uri, pi)?;
        if length == 0 {
            return None;
        }

        Some(request_uri[..length].to_owned())
    }

    pub fn save_base(&self, suffix: &str) -> Option<Self> {
        let uri_length = match &self.uri {
            Some(uri) => Some(find_unescaped_suffix(uri, suffix)?),
            None => None,
        };

        let path_info = self.get_path_info();
        let path_info_end = find_unescaped_suffix(path_info, suffix)?;

        let mut dest = self.clone();
        if let (Some(uri), Some(end)) = (&self.uri, uri_length) {
            dest.uri = Some(uri[..end].to_owned());
        }
        dest.path_info = Some(path_info[..path_info_end].to_owned());
        Some(dest)
    }

    pub fn load_base(&self, suffix: &str) -> Option<Self> {
        let unescaped = uri_unescape(suffix)?;

        let mut dest = self.clone();
        if let Some(uri) = &self.uri {
            dest.uri = Some(format!("{uri}{unescaped}"));
        }

        dest.path_info = Some(format!("{}{unescaped}", self.get_path_info()));
        Some(dest)
    }

    pub fn apply(&self, relative: &str) -> Option<Self> {
        let new_path_info = unescape_apply_path_info(self.path_info.as_deref(), relative)?;

        let mut dest = self.clone();
        dest.path_info = Some(new_path_info);
        Some(dest)
    }

    pub fn relative_to<'a>(&'a self, base: &Self) -> Option<&'a str> {
        if !self.is_same_program(base) {
            return None;
        }

        let path_info = self.path_info.as_deref()?;
        let base_path_info = base.path_info.as_deref()?;

        uri_relative(base_path_info, path_info)
    }

    pub fn relative_to_applied(&self, apply_base: &Self, relative: &str) -> Option<String> {
        if !self.is_same_program(apply_base) {
            return None;
        }

        let path_info = self.path_info.as_deref()?;

        let new_path_info = unescape_apply_path_info(apply_base.path_info.as_deref(), relative)?;

        uri_relative(path_info, &new_path_info).map(str::to_owned)
    }

    pub fn has_query_string(&self) -> bool {
        self.query_string.is_some()
    }
}

fn unescape_apply_path_info(base_path_info: Option<&str>, relative: &str) -> Option<String> {
    let base_path_info = base_path_info.unwrap_or("");

    if relative.is_empty() {
        return Some(base_path_info.to_owned());
    }

    if uri_has_authority(relative) {
        return None;
    }

    let unescaped = uri_unescape(relative)?;

    Some(uri_absolute(base_path_info, &unescaped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CgiAddress {
        let mut a = CgiAddress::new("/usr/lib/cgi-bin/app.cgi");
        a.script_name = Some("/app/".to_owned());
        a.path_info = Some("sub/page".to_owned());
        a
    }

    #[test]
    fn get_uri_assembles_parts() {
        let mut a = sample();
        assert_eq!(a.get_uri(), "/app/sub/page");

        a.query_string = Some("x=1".to_owned());
        assert_eq!(a.get_uri(), "/app/sub/page?x=1");

        a.path_info = Some("/sub".to_owned());
        assert_eq!(a.get_uri(), "/app/sub?x=1");

        a.uri = Some("/verbatim".to_owned());
        assert_eq!(a.get_uri(), "/verbatim");
    }

    #[test]
    fn child_id_ignores_request_fields() {
        let mut a = sample();
        let mut b = sample();
        b.path_info = Some("other/page".to_owned());
        assert_eq!(a.child_id(), b.child_id());

        b.args.push("--worker".to_owned());
        assert_ne!(a.child_id(), b.child_id());

        a.query_string = Some("x=1".to_owned());
        assert_eq!(a.child_id().value, sample().child_id().value);
    }

    #[test]
    fn id_covers_request_fields() {
        let a = sample();
        let mut b = sample();
        b.path_info = Some("other/page".to_owned());
        assert_ne!(a.id().value, b.id().value);
        assert_ne!(a.id().hash, b.id().hash);
    }

    #[test]
    fn id_component_order_is_significant() {
        let mut a = sample();
        a.params.push("A=1".to_owned());
        a.params.push("B=2".to_owned());

        let mut b = sample();
        b.params.push("B=2".to_owned());
        b.params.push("A=1".to_owned());

        assert_ne!(a.id().value, b.id().value);
    }

    #[test]
    fn cached_child_id_is_used() {
        let mut a = sample();
        a.post_cache_store();
        assert!(a.cached_child_id.is_some());
        assert_eq!(a.child_id(), sample().child_id());
    }

    #[test]
    fn auto_base_requires_slash() {
        let a = sample();
        /* script_name "/app/" is a base */
        assert_eq!(a.auto_base("/app/sub/page").as_deref(), Some("/app/"));

        let mut b = sample();
        b.script_name = Some("/app".to_owned());
        b.path_info = Some("/sub/page".to_owned());
        assert_eq!(b.auto_base("/app/sub/page").as_deref(), Some("/app/"));

        let mut c = sample();
        c.script_name = Some("/app".to_owned());
        c.path_info = Some("sub/page".to_owned());
        assert_eq!(c.auto_base("/app/sub/page"), None);
    }

    #[test]
    fn save_base_strips_suffix() {
        let a = sample();
        let saved = a.save_base("sub/page").unwrap();
        assert_eq!(saved.get_path_info(), "");

        assert!(a.save_base("nomatch").is_none());
    }

    #[test]
    fn save_load_round_trip_preserves_id() {
        let mut a = sample();
        a.uri = Some("/app/sub/page".to_owned());

        let saved = a.save_base("sub/page").unwrap();
        let loaded = saved.load_base("sub/page").unwrap();
        assert_eq!(loaded.id().value, a.id().value);
        assert_eq!(loaded.id().hash, a.id().hash);
    }

    #[test]
    fn apply_resolves_relative() {
        let mut a = sample();
        a.path_info = Some("/sub/page".to_owned());

        let applied = a.apply("other").unwrap();
        assert_eq!(applied.get_path_info(), "/sub/other");

        assert!(a.apply("//evil.example/x").is_none());
    }

    #[test]
    fn remote_was_validation() {
        use crate::address::list::ResolvedAddress;

        let mut a = sample();
        a.concurrency = 2;
        a.address_list
            .push(ResolvedAddress::Local("/run/app.was".to_owned()));
        assert!(a.check(true).is_ok());

        let mut no_concurrency = a.clone();
        no_concurrency.concurrency = 0;
        assert!(no_concurrency.check(true).is_err());

        let mut inet = sample();
        inet.concurrency = 2;
        inet.address_list.push(ResolvedAddress::Inet(
            "127.0.0.1:9000".parse().expect("valid address"),
        ));
        assert!(inet.check(true).is_err());
    }

    #[test]
    fn insert_args_extends_uri_and_path_info() {
        let mut a = sample();
        a.uri = Some("/app/sub/page?q".to_owned());
        a.insert_args("k=v", "/t");
        assert_eq!(a.uri.as_deref(), Some("/app/sub/page;k=v/t?q"));
        assert_eq!(a.get_path_info(), "sub/page;k=v/t");
    }
}
