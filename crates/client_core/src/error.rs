use shared::{
    domain::{AddressError, PeerAddress},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("messaging transport failure: {0:#}")]
    Transport(anyhow::Error),
    #[error("recipient {0} is not reachable on the messaging network")]
    NotMessageable(PeerAddress),
    #[error("invalid recipient address: {0}")]
    InvalidIdentifier(String),
    #[error("cannot open a conversation with your own address")]
    SelfConversation,
    #[error("a live subscription is already active")]
    AlreadyActive,
    #[error("no history cursor is open for this channel")]
    NoActiveCursor,
    #[error("a history page fetch is already in flight")]
    PageFetchInFlight,
    #[error("message dispatch failed: {0}")]
    SendFailed(String),
    #[error("message content must not be empty")]
    EmptyMessage,
    #[error("identity provider is not ready")]
    IdentityUnavailable,
    #[error("no messaging client is connected")]
    NoClient,
    #[error("marker storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Transport(_) => ErrorCode::Transport,
            SyncError::NotMessageable(_) => ErrorCode::NotMessageable,
            SyncError::InvalidIdentifier(_) | SyncError::SelfConversation => {
                ErrorCode::InvalidIdentifier
            }
            SyncError::AlreadyActive => ErrorCode::AlreadyActive,
            SyncError::NoActiveCursor => ErrorCode::NoActiveCursor,
            SyncError::PageFetchInFlight => ErrorCode::Busy,
            SyncError::SendFailed(_) => ErrorCode::SendFailed,
            SyncError::EmptyMessage => ErrorCode::Validation,
            SyncError::IdentityUnavailable | SyncError::NoClient => ErrorCode::Unauthenticated,
            SyncError::Storage(_) => ErrorCode::Storage,
        }
    }

    pub fn to_api_error(&self) -> ApiError {
        ApiError::new(self.code(), self.to_string())
    }
}

impl From<AddressError> for SyncError {
    fn from(value: AddressError) -> Self {
        SyncError::InvalidIdentifier(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
