mod auth;
mod backend;
mod config;
mod error;
mod fs;
mod handle_table;
mod identity;
mod localfs;
mod locks;
mod resolver;
mod util;

use auth::{AuthPolicy, CustomAuthPolicy, DefaultAuthPolicy};
use backend::HcfsBackend;
use clap::Parser;
use config::{AuthConfig, DEFAULT_FS_NAME, DEFAULT_MAX_OPEN_FILES, MountConfig};
use fs::HcfsFuse;
use fuse3::MountOptions;
use fuse3::path::Session;
#[cfg(unix)]
use futures_util::future::poll_fn;
use identity::{IdentityCache, NixIdentitySource};
use localfs::LocalBackend;
use log::info;
use std::path::PathBuf;
#[cfg(unix)]
use std::pin::Pin;
use std::sync::Arc;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
#[cfg(unix)]
use tokio::sync::oneshot;

#[derive(Parser, Debug)]
#[command(name = "hcfsfuse-rs")]
#[command(about = "Mount a Hadoop-compatible filesystem backend through FUSE")]
struct Cli {
    /// Backend root path the FUSE root maps onto.
    #[arg(long)]
    root: String,

    /// Mount point for the filesystem.
    mountpoint: PathBuf,

    /// Filesystem name reported to the kernel.
    #[arg(long, default_value = DEFAULT_FS_NAME)]
    fs_name: String,

    /// Enable debug logging.
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Raw mount option (allow_other, nonempty, ro); repeatable.
    #[arg(short = 'o', long = "fuse-opt")]
    fuse_opts: Vec<String>,

    /// Maximum number of concurrently open file handles.
    #[arg(long, default_value_t = DEFAULT_MAX_OPEN_FILES)]
    max_open_files: usize,

    /// Ownership policy for created objects: default or custom.
    #[arg(long, default_value = "default")]
    auth_policy: String,

    /// User name the custom policy assigns.
    #[arg(long)]
    auth_user: Option<String>,

    /// Group name the custom policy assigns.
    #[arg(long)]
    auth_group: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = MountConfig::new(cli.mountpoint, cli.root);
    config.fs_name = cli.fs_name;
    config.debug = cli.debug;
    config.fuse_opts = cli.fuse_opts;
    config.max_open_files = cli.max_open_files;
    config.auth = match cli.auth_policy.as_str() {
        "custom" => AuthConfig::Custom {
            user: cli.auth_user,
            group: cli.auth_group,
        },
        _ => AuthConfig::Default,
    };

    let default_filter = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let identity = Arc::new(IdentityCache::new(
        Box::new(NixIdentitySource),
        config.identity_cache_capacity,
    ));
    let auth = match &config.auth {
        AuthConfig::Default => AuthPolicy::Default(DefaultAuthPolicy::new(
            identity.clone(),
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )?),
        AuthConfig::Custom { user, group } => {
            AuthPolicy::Custom(CustomAuthPolicy::new(user.clone(), group.clone())?)
        }
    };

    let backend: Arc<dyn HcfsBackend> = Arc::new(LocalBackend::new());
    let fs = HcfsFuse::new(backend, &config, identity, auth);
    info!(
        "mounting {} at {} (backend root {})",
        fs.file_system_name(),
        config.mount_point.display(),
        config.root
    );

    let mut mount_opts = MountOptions::default();
    mount_opts.fs_name(config.fs_name.as_str());
    mount_opts.allow_other(config.has_fuse_opt("allow_other"));
    mount_opts.nonempty(config.has_fuse_opt("nonempty"));
    mount_opts.read_only(config.has_fuse_opt("ro"));

    let session = Session::new(mount_opts);
    let handle = session.mount(fs, config.mount_point).await?;

    #[cfg(unix)]
    {
        // Listen for termination signals and unmount cleanly before exiting.
        let (unmount_tx, unmount_rx) = oneshot::channel::<()>();

        let mut mount_task = tokio::spawn(async move {
            let mut handle = Some(handle);
            let mut handle_future = poll_fn(|cx| {
                let handle = handle.as_mut().expect("mount handle missing");
                Pin::new(handle).poll(cx)
            });

            let res = tokio::select! {
                res = &mut handle_future => res,
                _ = unmount_rx => {
                    let handle = handle.take().expect("mount handle missing");
                    handle.unmount().await
                }
            };

            res.map_err(anyhow::Error::from)
        });

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let signals = async {
            tokio::select! {
                _ = sigint.recv() => (),
                _ = sigterm.recv() => (),
            }
        };
        tokio::pin!(signals);

        let result = tokio::select! {
            res = &mut mount_task => res,
            _ = &mut signals => {
                let _ = unmount_tx.send(());
                mount_task.await
            }
        };

        result??;
    }

    #[cfg(not(unix))]
    {
        // Block until the filesystem is unmounted. This keeps the
        // process alive instead of exiting immediately after mount.
        handle.await?;
    }

    info!("unmounted");
    Ok(())
}
