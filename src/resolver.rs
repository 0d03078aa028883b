use std::ffi::{OsStr, OsString};
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

pub const PATH_CACHE_CAPACITY: usize = 500;

/// Translates FUSE-relative paths into fully qualified backend paths.
///
/// The mapping is a pure join against the mount root, so the bounded LRU is
/// only there to skip re-deriving hot paths; eviction can never be wrong.
pub struct PathResolver {
    root: String,
    cache: Mutex<LruCache<String, String>>,
}

impl PathResolver {
    pub fn new(root: &str, capacity: usize) -> Self {
        let root = root.trim_end_matches('/').to_string();
        let root = if root.is_empty() { "/".to_string() } else { root };
        Self {
            root,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    /// Resolves `fuse_path` (always absolute relative to the mount point)
    /// into the backend path. `/` resolves to the mount root itself.
    pub fn resolve(&self, fuse_path: &str) -> String {
        if let Some(hit) = self.cache.lock().get(fuse_path) {
            return hit.clone();
        }
        let resolved = self.derive(fuse_path);
        self.cache
            .lock()
            .put(fuse_path.to_string(), resolved.clone());
        resolved
    }

    fn derive(&self, fuse_path: &str) -> String {
        let rel = fuse_path.trim_start_matches('/');
        if rel.is_empty() {
            return self.root.clone();
        }
        if self.root == "/" {
            format!("/{rel}")
        } else {
            format!("{}/{}", self.root, rel)
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }
}

/// Joins a parent path and a child name the way the kernel expects the
/// composed path to look.
pub fn make_child_path(parent: &OsStr, name: &OsStr) -> OsString {
    if parent == OsStr::new("/") {
        let mut composed = OsString::from("/");
        composed.push(name);
        composed
    } else {
        let mut composed = OsString::from(parent);
        composed.push(OsStr::new("/"));
        composed.push(name);
        composed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_deterministic_and_idempotent() {
        let resolver = PathResolver::new("/data/base", PATH_CACHE_CAPACITY);
        let first = resolver.resolve("/a/b.txt");
        let second = resolver.resolve("/a/b.txt");
        assert_eq!(first, "/data/base/a/b.txt");
        assert_eq!(first, second);
    }

    #[test]
    fn root_resolves_to_mount_root() {
        let resolver = PathResolver::new("/data/base/", 8);
        assert_eq!(resolver.resolve("/"), "/data/base");
    }

    #[test]
    fn bare_root_mount() {
        let resolver = PathResolver::new("/", 8);
        assert_eq!(resolver.resolve("/"), "/");
        assert_eq!(resolver.resolve("/x"), "/x");
    }

    #[test]
    fn eviction_does_not_change_results() {
        let resolver = PathResolver::new("/base", 2);
        let before = resolver.resolve("/one");
        resolver.resolve("/two");
        resolver.resolve("/three");
        assert_eq!(resolver.resolve("/one"), before);
    }

    #[test]
    fn child_path_composition() {
        assert_eq!(
            make_child_path(OsStr::new("/"), OsStr::new("x")),
            OsString::from("/x")
        );
        assert_eq!(
            make_child_path(OsStr::new("/a/b"), OsStr::new("c")),
            OsString::from("/a/b/c")
        );
    }
}
