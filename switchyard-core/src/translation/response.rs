//! The parsed translation response.

use crate::address::ResourceAddress;
use crate::spawn::ChildOptions;

/// What the translation server decided for one request.
#[derive(Debug, Clone, Default)]
pub struct TranslateResponse {
    /// A non-zero status aborts the request with that HTTP status.
    pub status: u16,

    /// The backend this request is routed to.
    pub address: ResourceAddress,

    /// The base URI (`/`-terminated) the cache may key a whole
    /// subtree under.
    pub base: Option<String>,

    /// Store the address unmodified and apply the tail by simple
    /// concatenation on load.
    pub easy_base: bool,

    /// Skip the paranoid path check when re-deriving addresses from
    /// the base.
    pub unsafe_base: bool,

    /// Derive the base from the request URI and the CGI address
    /// (`auto_base()`).
    pub auto_base: bool,

    /// A program to execute (listen-stream responses).
    pub execute: Option<String>,

    /// Arguments for `execute`.
    pub args: Vec<String>,

    /// Child options for `execute`.
    pub child_options: ChildOptions,

    /// Diagnostic message accompanying an error status.
    pub message: Option<String>,
}

impl TranslateResponse {
    /// The NUL-separated child tag list (for bulk fade), from
    /// whichever options block the response carried.
    pub fn child_tag(&self) -> &str {
        if !self.child_options.tag.is_empty() {
            return &self.child_options.tag;
        }

        match self.address.cgi() {
            Some(cgi) => &cgi.options.tag,
            None => "",
        }
    }
}
