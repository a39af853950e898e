use thiserror::Error;

/// Exit code the external process uses when the image does not fit its 32-bit address space.
pub const EXIT_CODE_IMAGE_TOO_LARGE_FOR_X86: i32 = 5;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed or missing message fields. The exchange cannot continue.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("{context}: {source}")]
    ResourceFailure {
        context: String,
        #[source]
        source: std::io::Error,
    },
    /// `None` means the process was terminated without an exit code.
    #[error("External process failed with exit code {code:?}")]
    ExternalProcessFailure { code: Option<i32> },
    #[error("Image of {width}x{height} is too large for the 32-bit filter engine")]
    ImageTooLargeForX86 { width: u32, height: u32 },
    #[error("Invalid state: {0}")]
    StateViolation(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub(crate) fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::ResourceFailure {
            context: context.into(),
            source,
        }
    }

    /// Map an exit status of the external process to an error, `None` for success.
    pub fn from_exit_code(code: Option<i32>) -> Option<Self> {
        match code {
            Some(0) => None,
            Some(EXIT_CODE_IMAGE_TOO_LARGE_FOR_X86) => Some(Self::ImageTooLargeForX86 {
                width: 0,
                height: 0,
            }),
            code => Some(Self::ExternalProcessFailure { code }),
        }
    }

    /// Text shown to the user. Never sent to the external process.
    pub fn user_message(&self) -> String {
        match self {
            Self::ProtocolViolation(_) => {
                "The filter engine sent a message that could not be understood.".to_string()
            }
            Self::ResourceFailure { context, .. } => format!("{} failed.", context),
            Self::ExternalProcessFailure { code: Some(code) } => {
                format!("The filter engine exited unexpectedly (code {}).", code)
            }
            Self::ExternalProcessFailure { code: None } => {
                "The filter engine was terminated.".to_string()
            }
            Self::ImageTooLargeForX86 { .. } => {
                "The image is too large for the 32-bit filter engine. Use the 64-bit version."
                    .to_string()
            }
            Self::StateViolation(_) => "The filter session is in an invalid state.".to_string(),
            Self::Io(e) => format!("I/O error: {}", e),
            Self::Config(e) => format!("The configuration file is invalid: {}", e),
        }
    }
}
