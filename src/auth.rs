use std::sync::Arc;

use anyhow::{Context, bail};
use log::{debug, warn};

use crate::backend::HcfsBackend;
use crate::error::BackendResult;
use crate::identity::IdentityCache;

/// uid/gid of the process that issued the FUSE request, as reported by the
/// kernel.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

/// Ownership policy applied after an object is created on the backend.
/// Selected once at mount time; a closed set, no runtime plugin loading.
pub enum AuthPolicy {
    Default(DefaultAuthPolicy),
    Custom(CustomAuthPolicy),
}

impl AuthPolicy {
    pub async fn set_owner_if_needed(
        &self,
        backend: &dyn HcfsBackend,
        caller: Caller,
        path: &str,
    ) -> BackendResult<()> {
        match self {
            AuthPolicy::Default(policy) => policy.apply(backend, caller, path).await,
            AuthPolicy::Custom(policy) => policy.apply(backend, path).await,
        }
    }
}

/// Assigns the calling user's identity to created objects, but only when it
/// differs from the mount process's own: the backend already stamps the
/// process identity implicitly, so the equal case needs no round trip.
pub struct DefaultAuthPolicy {
    identity: Arc<IdentityCache>,
    process_uid: u32,
    process_gid: u32,
    process_user: String,
    process_group: String,
}

impl DefaultAuthPolicy {
    pub fn new(identity: Arc<IdentityCache>, process_uid: u32, process_gid: u32) -> anyhow::Result<Self> {
        let process_user = identity
            .user_name_of(process_uid)
            .with_context(|| format!("no user name for mount process uid {process_uid}"))?;
        let process_group = identity
            .group_name_of(process_gid)
            .with_context(|| format!("no group name for mount process gid {process_gid}"))?;
        Ok(Self {
            identity,
            process_uid,
            process_gid,
            process_user,
            process_group,
        })
    }

    async fn apply(
        &self,
        backend: &dyn HcfsBackend,
        caller: Caller,
        path: &str,
    ) -> BackendResult<()> {
        let mut user = None;
        let mut group = None;

        if caller.gid != self.process_gid {
            group = Some(self.identity.group_name_of(caller.gid).unwrap_or_else(|| {
                warn!(
                    "no group name for caller gid {}, falling back to {}",
                    caller.gid, self.process_group
                );
                self.process_group.clone()
            }));
        }
        if caller.uid != self.process_uid {
            user = Some(self.identity.user_name_of(caller.uid).unwrap_or_else(|| {
                warn!(
                    "no user name for caller uid {}, falling back to {}",
                    caller.uid, self.process_user
                );
                self.process_user.clone()
            }));
        }

        if user.is_some() || group.is_some() {
            debug!(
                "set owner of {} to {:?}:{:?} (caller {}:{})",
                path, user, group, caller.uid, caller.gid
            );
            backend
                .set_owner(path, user.as_deref(), group.as_deref())
                .await?;
        }
        Ok(())
    }
}

/// Stamps a statically configured user/group onto every created object,
/// ignoring the caller entirely.
pub struct CustomAuthPolicy {
    user: String,
    group: String,
}

impl CustomAuthPolicy {
    pub fn new(user: Option<String>, group: Option<String>) -> anyhow::Result<Self> {
        let (Some(user), Some(group)) = (user, group) else {
            bail!("custom auth policy requires both a user and a group name");
        };
        Ok(Self { user, group })
    }

    async fn apply(&self, backend: &dyn HcfsBackend, path: &str) -> BackendResult<()> {
        debug!("set owner of {} to {}:{}", path, self.user, self.group);
        backend
            .set_owner(path, Some(&self.user), Some(&self.group))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_policy_rejects_incomplete_configuration() {
        assert!(CustomAuthPolicy::new(Some("hive".into()), None).is_err());
        assert!(CustomAuthPolicy::new(None, Some("hadoop".into())).is_err());
        assert!(CustomAuthPolicy::new(Some("hive".into()), Some("hadoop".into())).is_ok());
    }
}
