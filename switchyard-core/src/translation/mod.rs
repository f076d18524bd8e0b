//! Client for the translation server: the external policy oracle
//! consulted per request and per listen-stream lookup.

pub mod client;
pub mod invalidate;
pub mod marshal;
pub mod parser;
pub mod protocol;
pub mod request;
pub mod response;

pub use client::TranslationService;
pub use invalidate::{InvalidateRequest, parse_invalidate};
pub use parser::{ParseResult, TranslateParser};
pub use protocol::{PROTOCOL_VERSION, TranslationCommand, TranslationError};
pub use request::TranslateRequest;
pub use response::TranslateResponse;
