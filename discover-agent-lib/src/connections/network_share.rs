//! Read-only NFS mounts.

use super::{
    ConnectContext, ConnectionDescriptor, ConnectorWarning, DataSourceConnection, ShareConnection,
    non_empty,
};
use crate::mount::MountError;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const LOCAL_MOUNT: &str = "local_mount";

/// Register an NFS datasource, mounting the export if needed.
///
/// Mount problems are logged and the connection is registered anyway; the
/// export may simply be inactive right now.
pub async fn connect_network_share(
    descriptor: &ConnectionDescriptor,
    ctx: &ConnectContext<'_>,
) -> Result<DataSourceConnection, ConnectorWarning> {
    let additional_info = descriptor.additional_info()?;
    let local_mount = additional_info
        .get(LOCAL_MOUNT)
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| ConnectorWarning::MissingField {
            connection: descriptor.name.clone(),
            field: LOCAL_MOUNT,
        })?;

    let mounted = match non_empty(&descriptor.host) {
        Some(host) => {
            let remote = format!(
                "{host}:{}",
                descriptor.mount_point.as_deref().unwrap_or_default()
            );
            match ensure_mounted(ctx, &remote, &local_mount).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to mount remote NFS folder {remote}: {e}");
                    false
                }
            }
        }
        None => {
            warn!(
                "Host not defined so cannot create NFS mount for {}",
                descriptor.name
            );
            false
        }
    };

    Ok(DataSourceConnection::NetworkShare(ShareConnection {
        descriptor: descriptor.clone(),
        additional_info,
        local_mount,
        mounted,
    }))
}

async fn ensure_mounted(
    ctx: &ConnectContext<'_>,
    remote: &str,
    local: &Path,
) -> Result<(), MountError> {
    if ctx.mounts.is_mount_point(local).await {
        return Ok(());
    }
    ctx.mounts.create_dir(local).await?;
    ctx.mounts.mount_nfs(remote, local).await?;
    info!("Mounted remote NFS folder {remote}");
    Ok(())
}
