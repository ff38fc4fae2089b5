use tracing::error;

#[derive(Debug)]
pub struct AppError(pub &'static str);

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AppError {
    fn description(&self) -> &str {
        self.0
    }
}

pub async fn handle_error(e: impl std::error::Error) {
    // TODO: We may want to do more than just print the message...
    error!("ERROR: {e}")
}

/// Failures raised by the speech capture/playback gateway.
///
/// `Unsupported` and `AlreadyActive` are rejected synchronously at the call
/// site; `Recognition` and `Synthesis` report faults on streams that were
/// already granted.
#[derive(Debug)]
pub enum SpeechError {
    /// The host offers no recognition capability.
    Unsupported,
    /// A recognition stream is already open on this gateway instance.
    AlreadyActive,
    Recognition(String),
    Synthesis(String),
}

impl std::fmt::Display for SpeechError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SpeechError::Unsupported => write!(f, "speech recognition not supported"),
            SpeechError::AlreadyActive => write!(f, "already listening"),
            SpeechError::Recognition(reason) => write!(f, "speech recognition error: {reason}"),
            SpeechError::Synthesis(reason) => write!(f, "speech synthesis error: {reason}"),
        }
    }
}

impl std::error::Error for SpeechError {}
