//! The `{ code, message, result }` wrapper every atelier backend responds with.

use crate::error::AtelierError;
use http::Response;
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Backend code meaning "ok".
pub const CODE_OK: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    pub result: Option<T>,
}

impl<T> Envelope<T> {
    /// A missing code is treated as success; some feature endpoints omit it.
    pub fn is_ok(&self) -> bool {
        self.code.is_none_or(|c| c == CODE_OK)
    }
}

pub fn parse<T: DeserializeOwned>(resp: &Response<Vec<u8>>) -> Result<Envelope<T>, AtelierError> {
    serde_json::from_slice(resp.body()).map_err(|e| AtelierError::ResponseFormatError {
        message: e.to_string(),
        raw_response: String::from_utf8_lossy(resp.body()).into_owned(),
    })
}
