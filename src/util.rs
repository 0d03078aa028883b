use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuse3::FileType;
use fuse3::path::reply::FileAttr;

use crate::backend::FileStatus;
use crate::identity::IdentityCache;

/// Most filesystems on linux limit the length of a file name to 255
/// characters; longer names are rejected before any backend round trip.
pub const MAX_NAME_LENGTH: usize = 255;

const BLKSIZE: u32 = 4096;

pub fn system_time_from_millis(ms: i64) -> SystemTime {
    if ms < 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::from_millis(ms as u64)
}

/// Builds the kernel-facing attributes for one backend status record.
/// Owner/group names translate through the identity cache; names unknown
/// to the local system show up as the sentinel id.
pub fn file_attr_from_status(status: &FileStatus, identity: &IdentityCache) -> FileAttr {
    let kind = if status.is_dir {
        FileType::Directory
    } else {
        FileType::RegularFile
    };
    // The backend reports modification time only; ctime mirrors it.
    let mtime = system_time_from_millis(status.mtime_ms);

    FileAttr {
        size: status.len,
        // st_blocks is counted in 512-byte units, for du.
        blocks: status.len.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        kind,
        perm: (status.perm & 0o7777) as u16,
        nlink: 1,
        uid: identity.display_uid(&status.owner),
        gid: identity.display_gid(&status.group),
        rdev: 0,
        blksize: BLKSIZE,
        #[cfg(target_os = "macos")]
        crtime: UNIX_EPOCH,
        #[cfg(target_os = "macos")]
        flags: 0,
    }
}

/// Final component of a backend or FUSE path.
pub fn final_component(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Pre-flight name-length gate: ENAMETOOLONG without contacting the
/// backend.
pub fn check_name_length(path: &str) -> Result<(), fuse3::Errno> {
    if final_component(path).len() > MAX_NAME_LENGTH {
        return Err(fuse3::Errno::from(libc::ENAMETOOLONG));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_component_variants() {
        assert_eq!(final_component("/a/b/c"), "c");
        assert_eq!(final_component("/a"), "a");
        assert_eq!(final_component("/a/b/"), "b");
    }

    #[test]
    fn name_length_boundary() {
        let ok = format!("/dir/{}", "x".repeat(MAX_NAME_LENGTH));
        assert!(check_name_length(&ok).is_ok());
        let too_long = format!("/dir/{}", "x".repeat(MAX_NAME_LENGTH + 1));
        assert_eq!(
            check_name_length(&too_long),
            Err(fuse3::Errno::from(libc::ENAMETOOLONG))
        );
    }

    #[test]
    fn negative_mtime_clamps_to_epoch() {
        assert_eq!(system_time_from_millis(-5), UNIX_EPOCH);
        assert_eq!(
            system_time_from_millis(1500),
            UNIX_EPOCH + Duration::from_millis(1500)
        );
    }
}
