//! The async client for the translation server.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::UnixStream;
use tracing::debug;

use super::marshal::marshal_translate_request;
use super::parser::{ParseResult, TranslateParser};
use super::protocol::TranslationError;
use super::request::TranslateRequest;
use super::response::TranslateResponse;

/// Consults the translation server over a UNIX stream socket, one
/// connection per request.
pub struct TranslationService {
    socket_path: PathBuf,
}

impl TranslationService {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one request and read the complete response.
    pub async fn translate(
        &self,
        request: &TranslateRequest,
    ) -> Result<TranslateResponse, TranslationError> {
        let wire = marshal_translate_request(request)?;

        let mut socket = UnixStream::connect(&self.socket_path).await?;
        socket.write_all(&wire).await?;

        let mut parser = TranslateParser::new();
        let mut buffer = [0u8; 4096];

        loop {
            let n = socket.read(&mut buffer).await?;
            if n == 0 {
                return Err(TranslationError::Incomplete);
            }

            if let ParseResult::Done = parser.feed(&buffer[..n])? {
                break;
            }
        }

        let response = parser.into_response();
        debug!(
            uri = request.uri.as_deref().unwrap_or(""),
            status = response.status,
            "translation complete"
        );
        Ok(response)
    }
}
