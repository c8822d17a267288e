//! Error type for the chat core, with stable machine-readable codes.

use stomp_frame::FrameError;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error: {0}")]
    Api(String),

    #[error("no credential available")]
    Unauthenticated,

    #[error("not connected")]
    NotConnected,

    #[error("outbox full ({capacity} frames pending)")]
    OutboxFull { capacity: usize },

    #[error("message is empty")]
    EmptyMessage,

    #[error("no active conversation partner")]
    NoActivePartner,

    #[error("not permitted: {0}")]
    NotPermitted(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ChatError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Transport(_) => "transport",
            Self::Handshake(_) => "handshake",
            Self::Frame(_) => "frame",
            Self::Json(_) => "json",
            Self::Http(_) => "http",
            Self::Api(_) => "api",
            Self::Unauthenticated => "unauthenticated",
            Self::NotConnected => "not_connected",
            Self::OutboxFull { .. } => "outbox_full",
            Self::EmptyMessage => "empty_message",
            Self::NoActivePartner => "no_active_partner",
            Self::NotPermitted(_) => "not_permitted",
            Self::Config(_) => "config",
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Http(_) | Self::NotConnected | Self::OutboxFull { .. }
        )
    }
}

impl From<figment::Error> for ChatError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
