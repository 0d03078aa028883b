use std::path::PathBuf;

use crate::identity::IDENTITY_CACHE_CAPACITY;
use crate::locks::LOCK_POOL_SIZE;
use crate::resolver::PATH_CACHE_CAPACITY;

pub const DEFAULT_FS_NAME: &str = "hcfsfuse";
pub const DEFAULT_MAX_OPEN_FILES: usize = 65_536;
/// FUSE delivers reads/writes of at most this size.
pub const DEFAULT_MAX_WRITE: u32 = 128 * 1024;

/// Ownership policy selection, fixed at mount time.
#[derive(Debug, Clone)]
pub enum AuthConfig {
    Default,
    Custom {
        user: Option<String>,
        group: Option<String>,
    },
}

/// Everything the mount session needs, assembled by the CLI layer.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub mount_point: PathBuf,
    /// Backend path the FUSE root maps onto.
    pub root: String,
    pub fs_name: String,
    pub debug: bool,
    /// Raw `-o` mount options as handed to the CLI.
    pub fuse_opts: Vec<String>,
    pub auth: AuthConfig,
    pub max_open_files: usize,
    pub lock_pool_size: usize,
    pub path_cache_capacity: usize,
    pub identity_cache_capacity: usize,
    pub max_write: u32,
}

impl MountConfig {
    pub fn new(mount_point: PathBuf, root: String) -> Self {
        Self {
            mount_point,
            root,
            fs_name: DEFAULT_FS_NAME.to_string(),
            debug: false,
            fuse_opts: Vec::new(),
            auth: AuthConfig::Default,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            lock_pool_size: LOCK_POOL_SIZE,
            path_cache_capacity: PATH_CACHE_CAPACITY,
            identity_cache_capacity: IDENTITY_CACHE_CAPACITY,
            max_write: DEFAULT_MAX_WRITE,
        }
    }

    pub fn has_fuse_opt(&self, name: &str) -> bool {
        self.fuse_opts.iter().any(|opt| opt == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuse_opt_lookup() {
        let mut config = MountConfig::new(PathBuf::from("/mnt/hcfs"), "/data".to_string());
        config.fuse_opts = vec!["allow_other".to_string(), "ro".to_string()];
        assert!(config.has_fuse_opt("allow_other"));
        assert!(config.has_fuse_opt("ro"));
        assert!(!config.has_fuse_opt("nonempty"));
    }
}
