use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum Error {
    /// Used when the user pass a logical invalid parameter to a function.
    #[error("Parameter error: {0}")]
    InvalidParameter(String),
    /// Session initialization could not proceed, e.g. missing or incompatible calibration.
    #[error("Setup error: {0}")]
    Setup(String),
    /// The camera center is not inside the scanning volume.
    #[error("Pose is outside of the scanning volume")]
    PoseOutsideVolume,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("Parser error: {0}")]
    Parser(String),
    #[error("Operation canceled")]
    Canceled,
}

impl Error {
    /// Create a error with the kind `InvalidParameter`.
    /// # Arguments
    /// * `msg` - The error message.
    pub fn invalid_parameter<T: ToString>(msg: T) -> Self {
        Error::InvalidParameter(msg.to_string())
    }

    /// Create a error with the kind `Setup`.
    pub fn setup<T: ToString>(msg: T) -> Self {
        Error::Setup(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
