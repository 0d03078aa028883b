use std::io;

use thiserror::Error;

/// Failure taxonomy for the backend client. Every adapter operation maps
/// these onto the negated-errno contract through [`BackendError::errno`];
/// nothing else is allowed to escape a FUSE callback.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("path already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("backend failure: {0}")]
    Other(String),
}

impl BackendError {
    pub fn errno(&self) -> fuse3::Errno {
        let code = match self {
            BackendError::NotFound(_) | BackendError::InvalidPath(_) => libc::ENOENT,
            BackendError::AlreadyExists(_) => libc::EEXIST,
            BackendError::Unsupported(_) => libc::EOPNOTSUPP,
            BackendError::Io(_) => libc::EIO,
            BackendError::Other(_) => libc::EBADMSG,
        };
        fuse3::Errno::from(code)
    }

    /// Classifies a raw I/O error the way the backend boundary expects:
    /// missing paths become `NotFound`, collisions become `AlreadyExists`,
    /// the rest stays generic I/O.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => BackendError::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => BackendError::AlreadyExists(path.to_string()),
            _ => BackendError::Io(err),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_taxonomy() {
        assert_eq!(
            BackendError::NotFound("/x".into()).errno(),
            fuse3::Errno::from(libc::ENOENT)
        );
        assert_eq!(
            BackendError::InvalidPath("/x".into()).errno(),
            fuse3::Errno::from(libc::ENOENT)
        );
        assert_eq!(
            BackendError::AlreadyExists("/x".into()).errno(),
            fuse3::Errno::from(libc::EEXIST)
        );
        assert_eq!(
            BackendError::Io(io::Error::other("boom")).errno(),
            fuse3::Errno::from(libc::EIO)
        );
        assert_eq!(
            BackendError::Other("??".into()).errno(),
            fuse3::Errno::from(libc::EBADMSG)
        );
        assert_eq!(
            BackendError::Unsupported("concat").errno(),
            fuse3::Errno::from(libc::EOPNOTSUPP)
        );
    }

    #[test]
    fn io_classification() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            BackendError::from_io(missing, "/a"),
            BackendError::NotFound(_)
        ));
        let exists = io::Error::new(io::ErrorKind::AlreadyExists, "there");
        assert!(matches!(
            BackendError::from_io(exists, "/a"),
            BackendError::AlreadyExists(_)
        ));
    }
}
