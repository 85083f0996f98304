// ⚠️ Error taxonomy for the registration core
// Caller-facing errors stay typed; mirror errors never leave the synchronizer

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Bad area / church / names shape. Message is shown to the caller verbatim.
    #[error("{0}")]
    Validation(String),

    /// Batch rejected because this name is already registered (or repeated in the batch)
    #[error("The name '{0}' has already been registered.")]
    Duplicate(String),

    #[error("No registrant named '{0}'")]
    NotFound(String),

    /// Status may only move Pending -> Approved
    #[error("Status of '{0}' cannot move back to Pending")]
    InvalidTransition(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl RegistryError {
    /// True for errors the caller can fix by changing the request
    pub fn is_user_error(&self) -> bool {
        !matches!(self, RegistryError::Storage(_))
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Any failure talking to the external mirror.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("mirror returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("mirror payload could not be decoded: {0}")]
    Decode(String),
}

pub type MirrorResult<T> = Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_message_names_offender() {
        let err = RegistryError::Duplicate("Ann Lee".to_string());
        assert_eq!(
            err.to_string(),
            "The name 'Ann Lee' has already been registered."
        );
        assert!(err.is_user_error());
    }

    #[test]
    fn test_storage_error_is_not_user_error() {
        let err = RegistryError::Storage(rusqlite::Error::QueryReturnedNoRows);
        assert!(!err.is_user_error());
    }
}
