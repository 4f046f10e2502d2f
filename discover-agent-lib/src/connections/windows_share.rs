//! Read-only SMB/CIFS mounts under a fresh temporary directory.

use super::{
    ConnectContext, ConnectionDescriptor, ConnectorWarning, DataSourceConnection, ShareConnection,
    non_empty,
};
use crate::mount::CifsMount;
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Split a Windows account into `(domain, user)`.
///
/// Accepts `DOMAIN\user`, `DOMAIN/user` and `user@DOMAIN`, checked in that
/// order. Any other form has an empty domain.
pub fn parse_domain_user(account: &str) -> (String, String) {
    if let Some((domain, user)) = account.split_once('\\') {
        (domain.to_string(), user.to_string())
    } else if let Some((domain, user)) = account.split_once('/') {
        (domain.to_string(), user.to_string())
    } else if let Some((user, domain)) = account.split_once('@') {
        (domain.to_string(), user.to_string())
    } else {
        (String::new(), account.to_string())
    }
}

/// Mount an SMB/CIFS share read-only under a fresh temporary directory.
///
/// A failed mount is logged; the connection is still registered with its
/// `local_mount` so work items can be correlated.
pub async fn connect_windows_share(
    descriptor: &ConnectionDescriptor,
    ctx: &ConnectContext<'_>,
) -> Result<DataSourceConnection, ConnectorWarning> {
    let missing = |field| ConnectorWarning::MissingField {
        connection: descriptor.name.clone(),
        field,
    };
    let host = non_empty(&descriptor.host).ok_or_else(|| missing("host"))?;
    let account = non_empty(&descriptor.user).ok_or_else(|| missing("user"))?;
    let ciphertext = non_empty(&descriptor.password).ok_or_else(|| missing("password"))?;
    let share = non_empty(&descriptor.mount_point).ok_or_else(|| missing("mount_point"))?;

    let password = ctx.decrypt(&descriptor.name, ciphertext)?;
    let (domain, user) = parse_domain_user(account);

    let local_mount = tempfile::Builder::new()
        .prefix("smb_")
        .suffix(&format!("_{}_{}", descriptor.name, descriptor.datasource))
        .tempdir_in(&ctx.settings.smb_mount_root)
        .map_err(|source| ConnectorWarning::LocalPath {
            connection: descriptor.name.clone(),
            source,
        })?
        .keep();

    let mount = CifsMount {
        share: share.to_string(),
        local_path: local_mount.clone(),
        user,
        password,
        domain,
    };
    let mounted = match ctx.mounts.mount_cifs(&mount).await {
        Ok(()) => {
            info!("Mounted SMB export {share} from {host}");
            true
        }
        Err(e) => {
            warn!("Failed to mount SMB export {host}: {e}");
            false
        }
    };

    let mut additional_info = Map::new();
    additional_info.insert(
        "local_mount".to_string(),
        Value::String(local_mount.display().to_string()),
    );

    Ok(DataSourceConnection::WindowsShare(ShareConnection {
        descriptor: descriptor.clone(),
        additional_info,
        local_mount,
        mounted,
    }))
}
