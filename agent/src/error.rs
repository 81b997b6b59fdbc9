//! Failures that end a user request in `Done(fatal_error)`.

use thiserror::Error;

use crate::core::types::ErrorKind;
use crate::io::model::ModelError;

#[derive(Debug, Error)]
pub enum FatalError {
    /// The model service failed after retries, or rejected the request.
    #[error("model unavailable: {0}")]
    ModelUnavailable(ModelError),
    /// A turn could not be persisted.
    #[error("session store write failed: {0:#}")]
    StoreWrite(anyhow::Error),
    /// A prompt template failed to render.
    #[error("prompt rendering failed: {0:#}")]
    Prompt(anyhow::Error),
}

impl FatalError {
    /// Taxonomy entry for the failure, when it has one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            FatalError::ModelUnavailable(_) => Some(ErrorKind::ModelUnavailable),
            FatalError::StoreWrite(_) => Some(ErrorKind::StoreWriteError),
            FatalError::Prompt(_) => None,
        }
    }
}

impl From<ModelError> for FatalError {
    fn from(err: ModelError) -> Self {
        FatalError::ModelUnavailable(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn kinds_map_to_taxonomy() {
        let err = FatalError::from(ModelError::Transient("503".to_string()));
        assert_eq!(err.kind(), Some(ErrorKind::ModelUnavailable));
        assert_eq!(
            err.to_string(),
            "model unavailable: transient model error: 503"
        );

        let err = FatalError::StoreWrite(anyhow!("disk full").context("append turn"));
        assert_eq!(err.kind(), Some(ErrorKind::StoreWriteError));
        assert_eq!(
            err.to_string(),
            "session store write failed: append turn: disk full"
        );
    }
}
