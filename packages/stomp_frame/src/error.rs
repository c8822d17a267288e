//! Codec errors with stable machine-readable codes.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    #[error("frame is missing its NUL terminator")]
    Unterminated,

    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),

    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

impl FrameError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Empty => "empty",
            Self::UnknownCommand(_) => "unknown_command",
            Self::MalformedHeader(_) => "malformed_header",
            Self::InvalidEscape(_) => "invalid_escape",
            Self::Unterminated => "unterminated",
            Self::InvalidContentLength(_) => "invalid_content_length",
            Self::TooLarge { .. } => "too_large",
        }
    }
}
