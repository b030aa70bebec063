use thiserror::Error;

/// Failures reported by the object store collaborator.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("chunk rejected for {0}")]
    Rejected(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The fixed status vocabulary returned to the kernel-side driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    NotFound,
    AlreadyExists,
    AccessDenied,
    DirectoryNotEmpty,
    NotImplemented,
    Error,
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("protocol violation on {path}: {reason}")]
    ProtocolViolation { path: String, reason: &'static str },

    #[error(transparent)]
    Transport(StoreError),
}

impl FsError {
    pub fn status(&self) -> Status {
        match self {
            FsError::NotFound(_) => Status::NotFound,
            FsError::AlreadyExists(_) => Status::AlreadyExists,
            FsError::AccessDenied(_) => Status::AccessDenied,
            FsError::DirectoryNotEmpty(_) => Status::DirectoryNotEmpty,
            FsError::NotImplemented(_) => Status::NotImplemented,
            FsError::ProtocolViolation { .. } | FsError::Transport(_) => Status::Error,
        }
    }
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => FsError::NotFound(key),
            other => FsError::Transport(other),
        }
    }
}

/// Status of a finished operation, success included.
pub fn status_of<T>(result: &std::result::Result<T, FsError>) -> Status {
    match result {
        Ok(_) => Status::Success,
        Err(e) => e.status(),
    }
}

#[derive(Error, Debug)]
pub enum MountError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("mount thread panicked: {0}")]
    Panicked(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed mount configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_not_found_status() {
        let err = FsError::from(StoreError::NotFound("a/b".into()));
        assert_eq!(err.status(), Status::NotFound);
    }

    #[test]
    fn transport_and_protocol_errors_are_generic() {
        let err = FsError::from(StoreError::Transport("reset".into()));
        assert_eq!(err.status(), Status::Error);
        let err = FsError::ProtocolViolation {
            path: "/x".into(),
            reason: "write without session",
        };
        assert_eq!(err.status(), Status::Error);
        assert_eq!(status_of::<()>(&Ok(())), Status::Success);
    }
}
