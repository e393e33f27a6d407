//! Error types for the agent.

use ssh_agent_lib::error::AgentError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("agent locked")]
    Locked,

    #[error("agent already locked")]
    AlreadyLocked,

    #[error("no matching identity")]
    NotFound,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("malformed age header: {0}")]
    MalformedHeader(String),

    #[error("decryption failed: {0}")]
    AuthenticationFailed(String),

    #[error("no recipient stanza matched the identity")]
    NoMatchingRecipient,

    #[error("unsupported extension: {0}")]
    UnsupportedExtension(String),

    #[error("unsupported request type {0}")]
    UnsupportedRequest(u8),

    #[error("agent refused the request")]
    AgentFailure,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short, stable name of the error kind for structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::AlreadyLocked => "already_locked",
            Self::NotFound => "not_found",
            Self::InvalidKey(_) => "invalid_key",
            Self::UnsupportedKeyType(_) => "unsupported_key_type",
            Self::MalformedHeader(_) => "malformed_header",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::NoMatchingRecipient => "no_matching_recipient",
            Self::UnsupportedExtension(_) => "unsupported_extension",
            Self::UnsupportedRequest(_) => "unsupported_request",
            Self::AgentFailure => "agent_failure",
            Self::Decode(_) => "decode",
            Self::Transport(_) => "transport",
            Self::Internal(_) => "internal",
        }
    }
}

impl Error {
    /// Protocol-level outcome of a failed extension call.
    ///
    /// Only "nothing here can handle this" outcomes become
    /// `SSH_AGENT_EXTENSION_FAILURE`; a locked agent or a broken payload stays
    /// a plain `SSH_AGENT_FAILURE` so the client can tell them apart.
    pub fn into_extension_error(self) -> AgentError {
        match self {
            Self::NotFound | Self::UnsupportedExtension(_) => AgentError::ExtensionFailure,
            other => other.into(),
        }
    }
}

/// Protocol-level outcome seen by the client for every other request.
impl From<Error> for AgentError {
    fn from(err: Error) -> Self {
        match err {
            Error::Transport(e) => Self::IO(e),
            _ => Self::Failure,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
