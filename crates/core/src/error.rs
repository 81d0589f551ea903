/// Result alias that carries the custom [`DublineError`] type.
pub type Result<T> = std::result::Result<T, DublineError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum DublineError {
    /// Free-form failure that does not warrant its own variant.
    #[error("{0}")]
    Message(String),
    /// A caller handed in data the operation cannot work with.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Fft(#[from] realfft::FftError),
    #[error(transparent)]
    Wav(#[from] hound::Error),
    /// Microphone missing, denied or failed to open. The session keeps
    /// working for playback.
    #[error("audio capture unavailable: {0}")]
    Capture(String),
    /// The requested node set cannot be applied to the engine.
    #[error("audio graph: {0}")]
    Graph(String),
    /// The external video transport rejected a call.
    #[error("video transport: {0}")]
    Transport(String),
    #[error("encoder: {0}")]
    Encoder(String),
    /// Export was requested before anything was recorded.
    #[error("nothing to export")]
    NothingToExport,
}

impl DublineError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Whether a session can keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Capture(_) | Self::Transport(_) | Self::Encoder(_) | Self::NothingToExport
        )
    }
}

impl From<&str> for DublineError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for DublineError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
