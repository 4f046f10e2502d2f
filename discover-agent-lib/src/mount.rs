//! Host mount operations and cluster probing.
//!
//! Everything that shells out to the host lives behind [`MountService`] so the
//! connectors can be driven without root privileges in tests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, trace};

/// Cluster membership tool shipped with the parallel file system.
pub const CLUSTER_PROBE_TOOL: &str = "/usr/lpp/mmfs/bin/mmlscluster";

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// A read-only CIFS mount.
#[derive(Clone, PartialEq, Eq)]
pub struct CifsMount {
    /// Share path, e.g. `//server/share`.
    pub share: String,
    pub local_path: PathBuf,
    pub user: String,
    pub password: String,
    /// Empty when the account has no domain.
    pub domain: String,
}

impl CifsMount {
    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            "cifs".to_string(),
            self.share.clone(),
            self.local_path.display().to_string(),
            "-o".to_string(),
            format!("user={}", self.user),
            "-o".to_string(),
            format!("password={}", self.password),
            "-o".to_string(),
            "ro".to_string(),
        ];
        if !self.domain.is_empty() {
            args.push("-o".to_string());
            args.push(format!("domain={}", self.domain));
        }
        args
    }
}

impl std::fmt::Debug for CifsMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CifsMount")
            .field("share", &self.share)
            .field("local_path", &self.local_path)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

#[async_trait]
pub trait MountService: Send + Sync {
    /// Whether `path` is the root of a mounted file system.
    async fn is_mount_point(&self, path: &Path) -> bool;

    /// Create `path` and any missing parents.
    async fn create_dir(&self, path: &Path) -> Result<(), MountError>;

    /// Read-only, `nolock` NFS mount of `remote` (`host:/export`) at `local`.
    async fn mount_nfs(&self, remote: &str, local: &Path) -> Result<(), MountError>;

    async fn mount_cifs(&self, mount: &CifsMount) -> Result<(), MountError>;

    /// Output of the cluster membership tool, or `None` if it cannot run.
    async fn cluster_membership(&self) -> Option<String>;
}

/// Runs the real `mount` binary.
#[derive(Debug, Clone, Default)]
pub struct SystemMountService;

impl SystemMountService {
    async fn run(&self, program: &str, args: &[String], shown: &str) -> Result<(), MountError> {
        trace!("Running: {shown}");
        let output = Command::new(program).args(args).output().await?;
        check_output(shown, output)
    }
}

fn check_output(shown: &str, output: Output) -> Result<(), MountError> {
    if output.status.success() {
        return Ok(());
    }
    Err(MountError::CommandFailed {
        command: shown.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[async_trait]
impl MountService for SystemMountService {
    async fn is_mount_point(&self, path: &Path) -> bool {
        is_mount_point(path)
    }

    async fn create_dir(&self, path: &Path) -> Result<(), MountError> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn mount_nfs(&self, remote: &str, local: &Path) -> Result<(), MountError> {
        let args: Vec<String> = ["-t", "nfs", "-o", "nolock", "-o", "ro", remote]
            .into_iter()
            .map(String::from)
            .chain(std::iter::once(local.display().to_string()))
            .collect();
        let shown = format!("mount {}", args.join(" "));
        self.run("mount", &args, &shown).await
    }

    async fn mount_cifs(&self, mount: &CifsMount) -> Result<(), MountError> {
        let shown = format!(
            "mount -t cifs {} {} -o ro",
            mount.share,
            mount.local_path.display()
        );
        self.run("mount", &mount.args(), &shown).await
    }

    async fn cluster_membership(&self) -> Option<String> {
        match Command::new(CLUSTER_PROBE_TOOL).output().await {
            Ok(output) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            Err(e) => {
                debug!("Cluster probe unavailable: {e}");
                None
            }
        }
    }
}

/// A path is a mount point when it lives on a different device than its
/// parent, or when it is the same inode as its parent (`/`).
#[cfg(unix)]
pub fn is_mount_point(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return false;
    };
    if meta.file_type().is_symlink() {
        return false;
    }
    let Ok(parent) = std::fs::metadata(path.join("..")) else {
        return false;
    };
    meta.dev() != parent.dev() || meta.ino() == parent.ino()
}

#[cfg(not(unix))]
pub fn is_mount_point(_path: &Path) -> bool {
    false
}
