use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Live room pool is full")]
    RoomPoolFull,

    #[error("No free endpoint for the requested user type")]
    UserTypeFull,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Human-readable message suitable for control-plane responses.
    #[must_use]
    pub fn control_message(&self) -> String {
        match self {
            Self::RoomPoolFull => "Get Push Failed Live Room Full".to_string(),
            Self::UserTypeFull => {
                "Get Push Failed Live Room User Full Or UserType Not Found".to_string()
            }
            other => other.to_string(),
        }
    }
}
