use async_trait::async_trait;

use crate::error::BackendResult;

/// Status record for one backend object, the shape `getFileStatus` and
/// `listStatus` return.
#[derive(Debug, Clone)]
pub struct FileStatus {
    /// Fully qualified backend path.
    pub path: String,
    pub len: u64,
    pub is_dir: bool,
    /// Permission bits (lower twelve bits are meaningful).
    pub perm: u32,
    /// Modification time in milliseconds since the epoch.
    pub mtime_ms: i64,
    pub owner: String,
    pub group: String,
}

impl FileStatus {
    /// Final path component, the name a directory listing shows.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Sequential input stream over one backend object.
///
/// Streams are not safe for concurrent use; the adapter serializes access
/// through its per-handle guard. Dropping a reader releases it.
#[async_trait]
pub trait BackendReader: Send {
    /// Current stream position.
    fn pos(&self) -> u64;

    /// Bytes readable beyond the current position without further backend
    /// round trips.
    async fn available(&self) -> BackendResult<u64>;

    async fn seek(&mut self, pos: u64) -> BackendResult<()>;

    /// Reads into `buf`, returning the byte count; `Ok(0)` is end of
    /// stream.
    async fn read(&mut self, buf: &mut [u8]) -> BackendResult<usize>;
}

/// Append-only output stream over one backend object. The backend model is
/// write-once: bytes go at the end, there is no seek.
#[async_trait]
pub trait BackendWriter: Send {
    async fn write_all(&mut self, data: &[u8]) -> BackendResult<()>;

    async fn flush(&mut self) -> BackendResult<()>;

    /// Flushes and finalizes the object. Called exactly once, on release.
    async fn close(&mut self) -> BackendResult<()>;
}

/// The Hadoop-compatible filesystem client this adapter delegates to. The
/// real implementation sits on the far side of an RPC boundary with its own
/// retry policy; everything here is a single logical round trip.
#[async_trait]
pub trait HcfsBackend: Send + Sync + 'static {
    async fn open(&self, path: &str) -> BackendResult<Box<dyn BackendReader>>;

    /// Creates (or overwrites) a file and returns its output stream.
    /// Missing parent directories are created, as HCFS `create` does.
    async fn create(&self, path: &str, perm: u32) -> BackendResult<Box<dyn BackendWriter>>;

    async fn file_status(&self, path: &str) -> BackendResult<FileStatus>;

    async fn list_status(&self, path: &str) -> BackendResult<Vec<FileStatus>>;

    async fn mkdirs(&self, path: &str, perm: u32) -> BackendResult<()>;

    async fn delete(&self, path: &str, recursive: bool) -> BackendResult<()>;

    async fn rename(&self, old: &str, new: &str) -> BackendResult<()>;

    /// `None` leaves the corresponding side unchanged.
    async fn set_owner(
        &self,
        path: &str,
        user: Option<&str>,
        group: Option<&str>,
    ) -> BackendResult<()>;

    async fn set_permission(&self, path: &str, perm: u32) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_name_is_final_component() {
        let status = FileStatus {
            path: "/data/warehouse/part-0001".to_string(),
            len: 0,
            is_dir: false,
            perm: 0o644,
            mtime_ms: 0,
            owner: "hive".to_string(),
            group: "hadoop".to_string(),
        };
        assert_eq!(status.name(), "part-0001");
    }
}
