//! The request descriptor sent to the translation server.

/// Everything the dispatcher knows about one incoming request.  Only
/// set fields are transmitted.
#[derive(Debug, Clone, Default)]
pub struct TranslateRequest {
    pub listener_tag: Option<String>,

    pub local_address: Option<String>,

    pub remote_host: Option<String>,
    pub host: Option<String>,
    pub alt_host: Option<String>,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,

    /// The value of the "Authorization" HTTP request header.
    pub authorization: Option<String>,

    pub uri: Option<String>,
    pub args: Option<String>,
    pub query_string: Option<String>,
    pub widget_type: Option<String>,

    pub session: Option<Vec<u8>>,
    pub realm_session: Option<Vec<u8>>,

    pub param: Option<String>,
    pub user: Option<String>,

    pub internal_redirect: Option<Vec<u8>>,
    pub enotdir: Option<Vec<u8>>,

    /// Ask for the process behind a listen-stream socket; the payload
    /// is the stock key (path, optionally `NUL tag`).
    pub mount_listen_stream: Option<Vec<u8>>,
}
