use std::io::SeekFrom;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use async_trait::async_trait;
use nix::unistd::{Gid, Uid};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::backend::{BackendReader, BackendWriter, FileStatus, HcfsBackend};
use crate::error::{BackendError, BackendResult};
use crate::identity::{IdentitySource, NixIdentitySource};

/// Backend over a local directory tree. This is the runnable stand-in for
/// a remote HCFS client: same trait, same stream discipline (sequential
/// reads, append-only writes), no RPC.
pub struct LocalBackend {
    identity: NixIdentitySource,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            identity: NixIdentitySource,
        }
    }

    async fn status_of(&self, path: &str) -> BackendResult<FileStatus> {
        let meta = fs::symlink_metadata(path)
            .await
            .map_err(|e| BackendError::from_io(e, path))?;
        let mtime_ms = meta.mtime() * 1000 + meta.mtime_nsec() / 1_000_000;
        let owner = self
            .identity
            .name_by_uid(meta.uid())
            .unwrap_or_else(|| meta.uid().to_string());
        let group = self
            .identity
            .name_by_gid(meta.gid())
            .unwrap_or_else(|| meta.gid().to_string());
        Ok(FileStatus {
            path: path.to_string(),
            len: meta.len(),
            is_dir: meta.is_dir(),
            perm: meta.mode() & 0o7777,
            mtime_ms,
            owner,
            group,
        })
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct LocalReader {
    file: File,
    pos: u64,
    len: u64,
}

#[async_trait]
impl BackendReader for LocalReader {
    fn pos(&self) -> u64 {
        self.pos
    }

    async fn available(&self) -> BackendResult<u64> {
        Ok(self.len.saturating_sub(self.pos))
    }

    async fn seek(&mut self, pos: u64) -> BackendResult<()> {
        self.file.seek(SeekFrom::Start(pos)).await?;
        self.pos = pos;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> BackendResult<usize> {
        let n = self.file.read(buf).await?;
        self.pos += n as u64;
        Ok(n)
    }
}

struct LocalWriter {
    file: File,
}

#[async_trait]
impl BackendWriter for LocalWriter {
    async fn write_all(&mut self, data: &[u8]) -> BackendResult<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> BackendResult<()> {
        self.file.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> BackendResult<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl HcfsBackend for LocalBackend {
    async fn open(&self, path: &str) -> BackendResult<Box<dyn BackendReader>> {
        let file = File::open(path)
            .await
            .map_err(|e| BackendError::from_io(e, path))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| BackendError::from_io(e, path))?
            .len();
        Ok(Box::new(LocalReader { file, pos: 0, len }))
    }

    async fn create(&self, path: &str, perm: u32) -> BackendResult<Box<dyn BackendWriter>> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::from_io(e, path))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| BackendError::from_io(e, path))?;
        fs::set_permissions(path, std::fs::Permissions::from_mode(perm & 0o7777))
            .await
            .map_err(|e| BackendError::from_io(e, path))?;
        Ok(Box::new(LocalWriter { file }))
    }

    async fn file_status(&self, path: &str) -> BackendResult<FileStatus> {
        self.status_of(path).await
    }

    async fn list_status(&self, path: &str) -> BackendResult<Vec<FileStatus>> {
        let mut dir = fs::read_dir(path)
            .await
            .map_err(|e| BackendError::from_io(e, path))?;
        let mut statuses = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| BackendError::from_io(e, path))?
        {
            let child = entry.path().to_string_lossy().into_owned();
            statuses.push(self.status_of(&child).await?);
        }
        Ok(statuses)
    }

    async fn mkdirs(&self, path: &str, perm: u32) -> BackendResult<()> {
        if fs::try_exists(path)
            .await
            .map_err(|e| BackendError::from_io(e, path))?
        {
            return Err(BackendError::AlreadyExists(path.to_string()));
        }
        fs::create_dir_all(path)
            .await
            .map_err(|e| BackendError::from_io(e, path))?;
        fs::set_permissions(path, std::fs::Permissions::from_mode(perm & 0o7777))
            .await
            .map_err(|e| BackendError::from_io(e, path))?;
        Ok(())
    }

    async fn delete(&self, path: &str, recursive: bool) -> BackendResult<()> {
        let meta = fs::symlink_metadata(path)
            .await
            .map_err(|e| BackendError::from_io(e, path))?;
        if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(path)
                    .await
                    .map_err(|e| BackendError::from_io(e, path))?;
            } else {
                fs::remove_dir(path)
                    .await
                    .map_err(|e| BackendError::from_io(e, path))?;
            }
        } else {
            fs::remove_file(path)
                .await
                .map_err(|e| BackendError::from_io(e, path))?;
        }
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> BackendResult<()> {
        // HCFS rename refuses to clobber, unlike POSIX rename.
        if fs::try_exists(new)
            .await
            .map_err(|e| BackendError::from_io(e, new))?
        {
            return Err(BackendError::AlreadyExists(new.to_string()));
        }
        fs::rename(old, new)
            .await
            .map_err(|e| BackendError::from_io(e, old))?;
        Ok(())
    }

    async fn set_owner(
        &self,
        path: &str,
        user: Option<&str>,
        group: Option<&str>,
    ) -> BackendResult<()> {
        let uid = match user {
            Some(name) => Some(Uid::from_raw(self.identity.uid_by_name(name).ok_or_else(
                || BackendError::Other(format!("unknown user {name}")),
            )?)),
            None => None,
        };
        let gid = match group {
            Some(name) => Some(Gid::from_raw(self.identity.gid_by_name(name).ok_or_else(
                || BackendError::Other(format!("unknown group {name}")),
            )?)),
            None => None,
        };
        nix::unistd::chown(Path::new(path), uid, gid)
            .map_err(|e| BackendError::from_io(e.into(), path))?;
        Ok(())
    }

    async fn set_permission(&self, path: &str, perm: u32) -> BackendResult<()> {
        fs::set_permissions(path, std::fs::Permissions::from_mode(perm & 0o7777))
            .await
            .map_err(|e| BackendError::from_io(e, path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_in(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new();
        let path = path_in(&dir, "f.txt");

        let mut writer = backend.create(&path, 0o644).await.unwrap();
        writer.write_all(b"hello hcfs").await.unwrap();
        writer.close().await.unwrap();

        let mut reader = backend.open(&path).await.unwrap();
        assert_eq!(reader.available().await.unwrap(), 10);
        let mut buf = [0u8; 10];
        let mut read = 0;
        while read < buf.len() {
            let n = reader.read(&mut buf[read..]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
        assert_eq!(&buf, b"hello hcfs");
        assert_eq!(reader.available().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn status_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new();
        let sub = path_in(&dir, "sub");
        backend.mkdirs(&sub, 0o755).await.unwrap();
        let file = format!("{sub}/data");
        backend
            .create(&file, 0o600)
            .await
            .unwrap()
            .close()
            .await
            .unwrap();

        let status = backend.file_status(&file).await.unwrap();
        assert!(!status.is_dir);
        assert_eq!(status.perm, 0o600);
        assert_eq!(status.name(), "data");

        let listed = backend.list_status(&sub).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "data");

        assert!(matches!(
            backend.file_status(&path_in(&dir, "missing")).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new();
        let a = path_in(&dir, "a");
        let b = path_in(&dir, "b");
        backend.create(&a, 0o644).await.unwrap().close().await.unwrap();
        backend.create(&b, 0o644).await.unwrap().close().await.unwrap();

        assert!(matches!(
            backend.rename(&a, &b).await,
            Err(BackendError::AlreadyExists(_))
        ));

        let c = path_in(&dir, "c");
        backend.rename(&a, &c).await.unwrap();
        assert!(backend.file_status(&c).await.is_ok());
    }

    #[tokio::test]
    async fn delete_is_recursive_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new();
        let sub = path_in(&dir, "tree");
        backend.mkdirs(&sub, 0o755).await.unwrap();
        backend
            .create(&format!("{sub}/leaf"), 0o644)
            .await
            .unwrap()
            .close()
            .await
            .unwrap();

        backend.delete(&sub, true).await.unwrap();
        assert!(matches!(
            backend.file_status(&sub).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mkdirs_rejects_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new();
        let sub = path_in(&dir, "d");
        backend.mkdirs(&sub, 0o755).await.unwrap();
        assert!(matches!(
            backend.mkdirs(&sub, 0o755).await,
            Err(BackendError::AlreadyExists(_))
        ));
    }
}
