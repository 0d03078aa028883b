use std::num::NonZeroUsize;

use lru::LruCache;
use nix::unistd::{Gid, Group, Uid, User};
use parking_lot::Mutex;

pub const IDENTITY_CACHE_CAPACITY: usize = 100;

/// Sentinel shown for owners/groups that do not resolve to a local
/// identity; `ls` renders it as nobody/nogroup.
pub const UNKNOWN_ID: u32 = u32::MAX;

/// System identity lookup. Split out so tests can substitute a fake and so
/// the cache owns no global state.
pub trait IdentitySource: Send + Sync {
    fn uid_by_name(&self, name: &str) -> Option<u32>;
    fn gid_by_name(&self, name: &str) -> Option<u32>;
    fn name_by_uid(&self, uid: u32) -> Option<String>;
    fn name_by_gid(&self, gid: u32) -> Option<String>;
    /// Name of the user's primary group.
    fn primary_group_of(&self, user: &str) -> Option<String>;
}

/// Identity lookup against the local user database.
pub struct NixIdentitySource;

impl IdentitySource for NixIdentitySource {
    fn uid_by_name(&self, name: &str) -> Option<u32> {
        User::from_name(name).ok().flatten().map(|u| u.uid.as_raw())
    }

    fn gid_by_name(&self, name: &str) -> Option<u32> {
        Group::from_name(name)
            .ok()
            .flatten()
            .map(|g| g.gid.as_raw())
    }

    fn name_by_uid(&self, uid: u32) -> Option<String> {
        User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name)
    }

    fn name_by_gid(&self, gid: u32) -> Option<String> {
        Group::from_gid(Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|g| g.name)
    }

    fn primary_group_of(&self, user: &str) -> Option<String> {
        let user = User::from_name(user).ok().flatten()?;
        Group::from_gid(user.gid).ok().flatten().map(|g| g.name)
    }
}

/// Bidirectional, bounded uid/gid ↔ name memos over an [`IdentitySource`].
///
/// Both hits and misses are memoized; entries are assumed valid for the
/// mount's lifetime, so eviction is capacity-driven only.
pub struct IdentityCache {
    source: Box<dyn IdentitySource>,
    uid_by_name: Mutex<LruCache<String, Option<u32>>>,
    gid_by_name: Mutex<LruCache<String, Option<u32>>>,
    name_by_uid: Mutex<LruCache<u32, Option<String>>>,
    name_by_gid: Mutex<LruCache<u32, Option<String>>>,
}

impl IdentityCache {
    pub fn new(source: Box<dyn IdentitySource>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            source,
            uid_by_name: Mutex::new(LruCache::new(capacity)),
            gid_by_name: Mutex::new(LruCache::new(capacity)),
            name_by_uid: Mutex::new(LruCache::new(capacity)),
            name_by_gid: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn uid_of(&self, user: &str) -> Option<u32> {
        if let Some(hit) = self.uid_by_name.lock().get(user) {
            return *hit;
        }
        let resolved = self.source.uid_by_name(user);
        self.uid_by_name.lock().put(user.to_string(), resolved);
        resolved
    }

    pub fn gid_of(&self, group: &str) -> Option<u32> {
        if let Some(hit) = self.gid_by_name.lock().get(group) {
            return *hit;
        }
        let resolved = self.source.gid_by_name(group);
        self.gid_by_name.lock().put(group.to_string(), resolved);
        resolved
    }

    pub fn user_name_of(&self, uid: u32) -> Option<String> {
        if let Some(hit) = self.name_by_uid.lock().get(&uid) {
            return hit.clone();
        }
        let resolved = self.source.name_by_uid(uid);
        self.name_by_uid.lock().put(uid, resolved.clone());
        resolved
    }

    pub fn group_name_of(&self, gid: u32) -> Option<String> {
        if let Some(hit) = self.name_by_gid.lock().get(&gid) {
            return hit.clone();
        }
        let resolved = self.source.name_by_gid(gid);
        self.name_by_gid.lock().put(gid, resolved.clone());
        resolved
    }

    /// Primary-group derivation used by chown when only the user side is
    /// given. Not memoized; it rides on the source directly.
    pub fn primary_group_of(&self, user: &str) -> Option<String> {
        self.source.primary_group_of(user)
    }

    /// uid for display purposes: the sentinel when the owner name is
    /// unknown to the local system.
    pub fn display_uid(&self, owner: &str) -> u32 {
        self.uid_of(owner).unwrap_or(UNKNOWN_ID)
    }

    pub fn display_gid(&self, group: &str) -> u32 {
        self.gid_of(group).unwrap_or(UNKNOWN_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeSource {
        lookups: Arc<AtomicUsize>,
    }

    impl IdentitySource for FakeSource {
        fn uid_by_name(&self, name: &str) -> Option<u32> {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            match name {
                "hive" => Some(1200),
                _ => None,
            }
        }

        fn gid_by_name(&self, name: &str) -> Option<u32> {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            match name {
                "hadoop" => Some(1300),
                _ => None,
            }
        }

        fn name_by_uid(&self, uid: u32) -> Option<String> {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            (uid == 1200).then(|| "hive".to_string())
        }

        fn name_by_gid(&self, gid: u32) -> Option<String> {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            (gid == 1300).then(|| "hadoop".to_string())
        }

        fn primary_group_of(&self, user: &str) -> Option<String> {
            (user == "hive").then(|| "hadoop".to_string())
        }
    }

    fn cache_with_counter() -> (IdentityCache, Arc<AtomicUsize>) {
        let lookups = Arc::new(AtomicUsize::new(0));
        let cache = IdentityCache::new(
            Box::new(FakeSource {
                lookups: lookups.clone(),
            }),
            IDENTITY_CACHE_CAPACITY,
        );
        (cache, lookups)
    }

    #[test]
    fn lookups_are_memoized() {
        let (cache, lookups) = cache_with_counter();
        assert_eq!(cache.uid_of("hive"), Some(1200));
        assert_eq!(cache.uid_of("hive"), Some(1200));
        assert_eq!(lookups.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn misses_are_memoized_too() {
        let (cache, lookups) = cache_with_counter();
        assert_eq!(cache.uid_of("ghost"), None);
        assert_eq!(cache.uid_of("ghost"), None);
        assert_eq!(lookups.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn display_ids_fall_back_to_sentinel() {
        let (cache, _) = cache_with_counter();
        assert_eq!(cache.display_uid("hive"), 1200);
        assert_eq!(cache.display_uid("ghost"), UNKNOWN_ID);
        assert_eq!(cache.display_gid("hadoop"), 1300);
        assert_eq!(cache.display_gid("ghosts"), UNKNOWN_ID);
    }

    #[test]
    fn reverse_direction_resolves() {
        let (cache, _) = cache_with_counter();
        assert_eq!(cache.user_name_of(1200).as_deref(), Some("hive"));
        assert_eq!(cache.group_name_of(1300).as_deref(), Some("hadoop"));
        assert_eq!(cache.user_name_of(9), None);
    }
}
