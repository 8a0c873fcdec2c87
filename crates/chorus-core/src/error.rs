use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChorusError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChorusError {
    /// Short error code string used in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            ChorusError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ChorusError>;
