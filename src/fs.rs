use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fuse3::path::prelude::*;
use fuse3::path::reply::{DirectoryEntryPlus, ReplyXAttr};
use fuse3::{FileType, SetAttr};
use log::{debug, error, trace};

use crate::auth::{AuthPolicy, Caller};
use crate::backend::{FileStatus, HcfsBackend};
use crate::config::MountConfig;
use crate::handle_table::OpenFileTable;
use crate::identity::IdentityCache;
use crate::locks::HandleLockPool;
use crate::resolver::{PathResolver, make_child_path};
use crate::util::{check_name_length, file_attr_from_status};

const ATTR_TTL: Duration = Duration::from_secs(1);

/// Permission bits for files implicitly created by a write-mode `open`.
const DEFAULT_CREATE_PERM: u32 = 0o644;

/// The FUSE callback adapter: maps kernel-issued path operations onto the
/// backend client and backend failures onto negated errnos.
///
/// Every callback delegates to a `*_internal` method; the trait impl only
/// converts kernel types and extracts the caller context, so the operation
/// contracts stay testable against a fake backend.
pub struct HcfsFuse {
    backend: Arc<dyn HcfsBackend>,
    resolver: PathResolver,
    identity: Arc<IdentityCache>,
    handles: OpenFileTable,
    locks: HandleLockPool,
    auth: AuthPolicy,
    max_open_files: usize,
    max_write: NonZeroU32,
    fs_name: String,
}

impl HcfsFuse {
    pub fn new(
        backend: Arc<dyn HcfsBackend>,
        config: &MountConfig,
        identity: Arc<IdentityCache>,
        auth: AuthPolicy,
    ) -> Self {
        let bytes = config.max_write.max(4096);
        let max_write = NonZeroU32::new(bytes).unwrap_or_else(|| NonZeroU32::new(4096).unwrap());
        Self {
            backend,
            resolver: PathResolver::new(&config.root, config.path_cache_capacity),
            identity,
            handles: OpenFileTable::new(),
            locks: HandleLockPool::new(config.lock_pool_size),
            auth,
            max_open_files: config.max_open_files,
            max_write,
            fs_name: config.fs_name.clone(),
        }
    }

    pub fn file_system_name(&self) -> &str {
        &self.fs_name
    }

    fn path_str(path: &OsStr) -> Result<&str, fuse3::Errno> {
        path.to_str().ok_or_else(|| fuse3::Errno::from(libc::EINVAL))
    }

    async fn getattr_internal(&self, path: &str) -> Result<FileAttr, fuse3::Errno> {
        let uri = self.resolver.resolve(path);
        match self.backend.file_status(&uri).await {
            Ok(status) => Ok(file_attr_from_status(&status, &self.identity)),
            Err(err) if err.errno() == fuse3::Errno::from(libc::ENOENT) => {
                debug!("getattr {path}: path does not exist or is invalid");
                Err(fuse3::Errno::new_not_exist())
            }
            Err(err) => {
                error!("getattr {path}: {err}");
                Err(fuse3::Errno::from(libc::EIO))
            }
        }
    }

    async fn readdir_internal(&self, path: &str) -> Result<Vec<DirectoryEntry>, fuse3::Errno> {
        let statuses = self.list_internal(path).await?;
        let mut entries = Vec::with_capacity(statuses.len() + 2);
        entries.push(DirectoryEntry {
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        entries.push(DirectoryEntry {
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, status) in statuses.iter().enumerate() {
            entries.push(DirectoryEntry {
                kind: if status.is_dir {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                },
                name: OsString::from(status.name()),
                offset: (i as i64) + 3,
            });
        }
        Ok(entries)
    }

    /// Children in the order the backend reports them; no sorting, no
    /// per-entry metadata fetches.
    async fn list_internal(&self, path: &str) -> Result<Vec<FileStatus>, fuse3::Errno> {
        let uri = self.resolver.resolve(path);
        self.backend.list_status(&uri).await.map_err(|err| {
            error!("readdir {path}: {err}");
            fuse3::Errno::from(libc::EIO)
        })
    }

    async fn mkdir_internal(
        &self,
        caller: Caller,
        path: &str,
        mode: u32,
    ) -> Result<(), fuse3::Errno> {
        check_name_length(path)?;
        let uri = self.resolver.resolve(path);
        self.backend.mkdirs(&uri, mode).await.map_err(|err| {
            debug!("mkdir {path}: {err}");
            err.errno()
        })?;
        self.auth
            .set_owner_if_needed(&*self.backend, caller, &uri)
            .await
            .map_err(|err| {
                error!("mkdir {path}: applying ownership failed: {err}");
                err.errno()
            })
    }

    async fn create_internal(
        &self,
        caller: Caller,
        path: &str,
        mode: u32,
    ) -> Result<u64, fuse3::Errno> {
        check_name_length(path)?;
        if self.handles.len() >= self.max_open_files {
            error!("create {path}: too many open files ({})", self.max_open_files);
            return Err(fuse3::Errno::from(libc::EMFILE));
        }
        let uri = self.resolver.resolve(path);
        let writer = self.backend.create(&uri, mode).await.map_err(|err| {
            debug!("create {path}: {err}");
            err.errno()
        })?;
        let fh = self.handles.allocate(path, None, Some(writer));
        if let Err(err) = self
            .auth
            .set_owner_if_needed(&*self.backend, caller, &uri)
            .await
        {
            error!("create {path}: applying ownership failed: {err}");
            self.close_handle(fh).await.ok();
            return Err(err.errno());
        }
        Ok(fh)
    }

    async fn open_internal(
        &self,
        caller: Caller,
        path: &str,
        flags: u32,
    ) -> Result<u64, fuse3::Errno> {
        if self.handles.len() >= self.max_open_files {
            error!("open {path}: too many open files ({})", self.max_open_files);
            return Err(fuse3::Errno::from(libc::EMFILE));
        }
        let uri = self.resolver.resolve(path);
        let write_mode = (flags as i32 & libc::O_ACCMODE) != libc::O_RDONLY;

        let reader = self.backend.open(&uri).await.map_err(|err| {
            debug!("open {path}: {err}");
            err.errno()
        })?;
        let writer = if write_mode {
            let writer = self
                .backend
                .create(&uri, DEFAULT_CREATE_PERM)
                .await
                .map_err(|err| {
                    debug!("open {path} for write: {err}");
                    err.errno()
                })?;
            Some(writer)
        } else {
            None
        };

        let created = writer.is_some();
        let fh = self.handles.allocate(path, Some(reader), writer);
        if created {
            if let Err(err) = self
                .auth
                .set_owner_if_needed(&*self.backend, caller, &uri)
                .await
            {
                error!("open {path}: applying ownership failed: {err}");
                self.close_handle(fh).await.ok();
                return Err(err.errno());
            }
        }
        Ok(fh)
    }

    async fn read_internal(
        &self,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, fuse3::Errno> {
        if size as u64 > i32::MAX as u64 {
            return Err(fuse3::Errno::from(libc::EINVAL));
        }
        let entry = self
            .handles
            .get(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADFD))?;

        let stripe = self.locks.lock_for(fh);
        let _guard = stripe.write().await;
        let mut io = entry.io.lock().await;
        let Some(reader) = io.reader.as_mut() else {
            error!("read: handle {fh} was not opened for reading");
            return Err(fuse3::Errno::from(libc::EBADFD));
        };

        let mut buf = vec![0u8; size as usize];
        let mut nread = 0usize;
        let pos = reader.pos();
        let available = reader.available().await.map_err(|err| err.errno())?;
        // Only serve offsets inside the stream's current availability
        // window; anything else reads as empty rather than triggering a
        // backend backfill.
        if (offset as i64) - (pos as i64) < available as i64 {
            reader.seek(offset).await.map_err(|err| err.errno())?;
            while nread < buf.len() {
                let n = reader.read(&mut buf[nread..]).await.map_err(|err| {
                    error!("read: handle {fh} offset {offset}: {err}");
                    err.errno()
                })?;
                if n == 0 {
                    break;
                }
                nread += n;
            }
        }
        buf.truncate(nread);
        Ok(Bytes::from(buf))
    }

    async fn write_internal(
        &self,
        fh: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, fuse3::Errno> {
        let entry = self
            .handles
            .get(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADFD))?;

        let stripe = self.locks.lock_for(fh);
        let _guard = stripe.write().await;
        let mut io = entry.io.lock().await;
        let cursor = io.write_cursor;
        let Some(writer) = io.writer.as_mut() else {
            error!("write: handle {fh} was not opened for writing");
            return Err(fuse3::Errno::from(libc::EBADFD));
        };

        // Offsets below the cursor are retries of writes the append-only
        // backend has already applied; acknowledge without touching it.
        if offset < cursor {
            return Ok(data.len() as u32);
        }

        writer.write_all(data).await.map_err(|err| {
            error!("write: handle {fh} offset {offset}: {err}");
            err.errno()
        })?;
        io.write_cursor = offset + data.len() as u64;
        Ok(data.len() as u32)
    }

    async fn flush_internal(&self, fh: u64) -> Result<(), fuse3::Errno> {
        let entry = self
            .handles
            .get(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADFD))?;
        // Deliberately not stripe-guarded: flush only forwards to the
        // backend's flush and may race an in-flight write.
        let mut io = entry.io.lock().await;
        match io.writer.as_mut() {
            Some(writer) => writer.flush().await.map_err(|err| {
                error!("flush: handle {fh}: {err}");
                fuse3::Errno::from(libc::EIO)
            }),
            None => Ok(()),
        }
    }

    async fn release_internal(&self, fh: u64) -> Result<(), fuse3::Errno> {
        self.close_handle(fh).await
    }

    /// Removes the entry and closes whatever streams it holds, under the
    /// handle's stripe lock.
    async fn close_handle(&self, fh: u64) -> Result<(), fuse3::Errno> {
        let Some(entry) = self.handles.remove(fh) else {
            error!("release: unknown handle {fh}");
            return Err(fuse3::Errno::from(libc::EBADFD));
        };
        let stripe = self.locks.lock_for(fh);
        let _guard = stripe.write().await;
        let mut io = entry.io.lock().await;
        io.reader.take();
        if let Some(mut writer) = io.writer.take() {
            writer.close().await.map_err(|err| {
                error!("release: closing handle {fh}: {err}");
                fuse3::Errno::from(libc::EIO)
            })?;
        }
        Ok(())
    }

    async fn rename_internal(&self, old_path: &str, new_path: &str) -> Result<(), fuse3::Errno> {
        check_name_length(new_path)?;
        let old_uri = self.resolver.resolve(old_path);
        let new_uri = self.resolver.resolve(new_path);
        self.backend.rename(&old_uri, &new_uri).await.map_err(|err| {
            debug!("rename {old_path} -> {new_path}: {err}");
            err.errno()
        })?;
        // Handles opened against the old path stay valid after the backend
        // object moved.
        self.handles.rename_path(old_path, new_path);
        Ok(())
    }

    async fn remove_internal(&self, path: &str) -> Result<(), fuse3::Errno> {
        let uri = self.resolver.resolve(path);
        self.backend.delete(&uri, true).await.map_err(|err| {
            debug!("remove {path}: {err}");
            err.errno()
        })
    }

    async fn chmod_internal(&self, path: &str, mode: u32) -> Result<(), fuse3::Errno> {
        let uri = self.resolver.resolve(path);
        self.backend
            .set_permission(&uri, mode & 0o7777)
            .await
            .map_err(|err| {
                error!("chmod {path}: {err}");
                err.errno()
            })
    }

    async fn chown_internal(
        &self,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), fuse3::Errno> {
        // The kernel hands through u32::MAX for the side chown left unset.
        let uid = uid.filter(|&id| id != u32::MAX);
        let gid = gid.filter(|&id| id != u32::MAX);

        let user_name = match uid {
            Some(uid) => Some(self.identity.user_name_of(uid).ok_or_else(|| {
                error!("chown {path}: no user name for uid {uid}");
                fuse3::Errno::from(libc::EINVAL)
            })?),
            None => None,
        };
        let group_name = match gid {
            Some(gid) => Some(self.identity.group_name_of(gid).ok_or_else(|| {
                error!("chown {path}: no group name for gid {gid}");
                fuse3::Errno::from(libc::EINVAL)
            })?),
            None => user_name
                .as_deref()
                .and_then(|user| self.identity.primary_group_of(user)),
        };

        if user_name.is_none() && group_name.is_none() {
            debug!("chown {path}: nothing to change");
            return Ok(());
        }

        let uri = self.resolver.resolve(path);
        self.backend
            .set_owner(&uri, user_name.as_deref(), group_name.as_deref())
            .await
            .map_err(|err| {
                error!("chown {path}: {err}");
                err.errno()
            })
    }
}

impl PathFilesystem for HcfsFuse {
    async fn init(&self, _req: Request) -> Result<ReplyInit, fuse3::Errno> {
        Ok(ReplyInit {
            max_write: self.max_write,
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let attr = self.getattr_internal(Self::path_str(&path)?).await?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        _fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;
        let path = Self::path_str(path)?;
        trace!("getattr({path})");
        let attr = self.getattr_internal(path).await?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;
        let path = Self::path_str(path)?;
        trace!("setattr({path}, {set_attr:?})");

        if let Some(mode) = set_attr.mode {
            self.chmod_internal(path, mode).await?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            self.chown_internal(path, set_attr.uid, set_attr.gid).await?;
        }
        // Size changes (truncate) and time updates are accepted and
        // dropped; the backend is append-only and owns its mtimes.

        let attr = self.getattr_internal(path).await?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let path = Self::path_str(&path)?;
        trace!("mkdir({path}, {mode:o})");
        let caller = Caller {
            uid: req.uid,
            gid: req.gid,
        };
        self.mkdir_internal(caller, path, mode).await?;
        let attr = self.getattr_internal(path).await?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn create(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> Result<ReplyCreated, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let path = Self::path_str(&path)?;
        trace!("create({path}, {mode:o})");
        let caller = Caller {
            uid: req.uid,
            gid: req.gid,
        };
        let fh = self.create_internal(caller, path, mode).await?;
        let attr = self.getattr_internal(path).await?;
        Ok(ReplyCreated {
            ttl: ATTR_TTL,
            attr,
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn open(
        &self,
        req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        let path = Self::path_str(path)?;
        trace!("open({path}, {flags:#x})");
        let caller = Caller {
            uid: req.uid,
            gid: req.gid,
        };
        let fh = self.open_internal(caller, path, flags).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData, fuse3::Errno> {
        trace!("read({path:?}, fh={fh}, offset={offset}, size={size})");
        let data = self.read_internal(fh, offset, size).await?;
        Ok(data.into())
    }

    async fn write(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite, fuse3::Errno> {
        trace!("write({path:?}, fh={fh}, offset={offset}, size={})", data.len());
        let written = self.write_internal(fh, offset, data).await?;
        Ok(ReplyWrite { written })
    }

    async fn flush(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
    ) -> Result<(), fuse3::Errno> {
        trace!("flush({path:?}, fh={fh})");
        self.flush_internal(fh).await
    }

    async fn fsync(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        _datasync: bool,
    ) -> Result<(), fuse3::Errno> {
        trace!("fsync({path:?}, fh={fh})");
        self.flush_internal(fh).await
    }

    async fn release(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<(), fuse3::Errno> {
        trace!("release({path:?}, fh={fh})");
        self.release_internal(fh).await
    }

    async fn rename(
        &self,
        _req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let old_path = make_child_path(origin_parent, origin_name);
        let new_path = make_child_path(parent, name);
        let old_path = Self::path_str(&old_path)?;
        let new_path = Self::path_str(&new_path)?;
        trace!("rename({old_path}, {new_path})");
        self.rename_internal(old_path, new_path).await
    }

    async fn unlink(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let path = make_child_path(parent, name);
        let path = Self::path_str(&path)?;
        trace!("unlink({path})");
        self.remove_internal(path).await
    }

    async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> Result<(), fuse3::Errno> {
        let path = make_child_path(parent, name);
        let path = Self::path_str(&path)?;
        trace!("rmdir({path})");
        self.remove_internal(path).await
    }

    async fn opendir(
        &self,
        _req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        trace!("opendir({path:?})");
        // Directory reads are stateless; no handle is allocated.
        Ok(ReplyOpen { fh: 0, flags })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _path: &OsStr,
        _fh: u64,
        _flags: u32,
    ) -> Result<(), fuse3::Errno> {
        Ok(())
    }

    type DirEntryStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'a>>, fuse3::Errno> {
        let path = Self::path_str(path)?;
        trace!("readdir({path}, offset={offset})");
        let entries = self.readdir_internal(path).await?;
        let skip = offset.max(0) as usize;
        let entries: Vec<fuse3::Result<DirectoryEntry>> =
            entries.into_iter().skip(skip).map(Ok).collect();
        Ok(ReplyDirectory {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: &'a OsStr,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>, fuse3::Errno> {
        let path = Self::path_str(parent)?;
        trace!("readdirplus({path}, offset={offset})");

        let dir_attr = self.getattr_internal(path).await?;
        let statuses = self.list_internal(path).await?;

        let mut entries = Vec::with_capacity(statuses.len() + 2);
        entries.push(DirectoryEntryPlus {
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: dir_attr,
            entry_ttl: ATTR_TTL,
            attr_ttl: ATTR_TTL,
        });
        entries.push(DirectoryEntryPlus {
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
            attr: dir_attr,
            entry_ttl: ATTR_TTL,
            attr_ttl: ATTR_TTL,
        });
        for (i, status) in statuses.iter().enumerate() {
            entries.push(DirectoryEntryPlus {
                kind: if status.is_dir {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                },
                name: OsString::from(status.name()),
                offset: (i as i64) + 3,
                attr: file_attr_from_status(status, &self.identity),
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            });
        }

        let skip = offset as usize;
        let entries: Vec<fuse3::Result<DirectoryEntryPlus>> =
            entries.into_iter().skip(skip).map(Ok).collect();
        Ok(ReplyDirectoryPlus {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> Result<ReplyStatFs, fuse3::Errno> {
        // The backend exposes no capacity statistics; report conservative
        // constants so df has something well-formed to show.
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: crate::util::MAX_NAME_LENGTH as u32,
            frsize: 4096,
        })
    }

    // The xattr family is not implemented against the backend; every call
    // succeeds without effect.
    async fn setxattr(
        &self,
        _req: Request,
        _path: &OsStr,
        _name: &OsStr,
        _value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> Result<(), fuse3::Errno> {
        Ok(())
    }

    async fn getxattr(
        &self,
        _req: Request,
        _path: &OsStr,
        _name: &OsStr,
        _size: u32,
    ) -> Result<ReplyXAttr, fuse3::Errno> {
        Ok(ReplyXAttr::Size(0))
    }

    async fn listxattr(
        &self,
        _req: Request,
        _path: &OsStr,
        _size: u32,
    ) -> Result<ReplyXAttr, fuse3::Errno> {
        Ok(ReplyXAttr::Size(0))
    }

    async fn removexattr(
        &self,
        _req: Request,
        _path: &OsStr,
        _name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        Ok(())
    }
}
