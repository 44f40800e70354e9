use chokepoint::TypeMismatch;
use supaclient::RemoteError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("not signed in")]
    NotAuthenticated,

    /// A favourite was toggled without a user. The caller should prompt for sign-in.
    #[error("sign in to keep favourites")]
    AuthRequired,

    #[error("no destination is selected")]
    MissingScope,

    #[error("{0}")]
    Validation(String),

    #[error("image upload failed: {0}")]
    Upload(RemoteError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Cache(#[from] TypeMismatch),
}

impl SyncError {
    /// Errors detected locally, before any request was sent.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SyncError::NotAuthenticated
                | SyncError::AuthRequired
                | SyncError::MissingScope
                | SyncError::Validation(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}
