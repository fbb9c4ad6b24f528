use serde::{Deserialize, Serialize};

/// Error categories the presentation layer can branch on, e.g. to show
/// "recipient unreachable" rather than "service unavailable".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Transport,
    NotMessageable,
    InvalidIdentifier,
    AlreadyActive,
    NoActiveCursor,
    Busy,
    SendFailed,
    Unauthenticated,
    Validation,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
