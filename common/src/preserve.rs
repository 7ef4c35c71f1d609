use anyhow::{Context, Result};
use std::os::unix::fs::MetadataExt;
use std::os::unix::prelude::PermissionsExt;
use tracing::{event, instrument, Level};

#[derive(Copy, Clone, Debug, Default)]
pub struct UserAndTimeSettings {
    pub uid: bool,
    pub gid: bool,
    pub time: bool,
}

impl UserAndTimeSettings {
    pub fn any(&self) -> bool {
        self.uid || self.gid || self.time
    }
}

/// What to carry over from a source file to its copy.
#[derive(Copy, Clone, Debug)]
pub struct Settings {
    pub user_and_time: UserAndTimeSettings,
    pub mode_mask: u32,
}

impl Default for Settings {
    fn default() -> Self {
        preserve_default()
    }
}

#[instrument]
async fn set_owner_and_time(
    settings: &UserAndTimeSettings,
    path: &std::path::Path,
    metadata: &std::fs::Metadata,
) -> Result<()> {
    if !settings.any() {
        return Ok(());
    }
    let settings = settings.to_owned();
    let dst = path.to_owned();
    let metadata = metadata.to_owned();
    tokio::task::spawn_blocking(move || -> Result<()> {
        // set timestamps first - those are unlikely to fail
        if settings.time {
            event!(Level::DEBUG, "setting timestamps");
            let atime = filetime::FileTime::from_last_access_time(&metadata);
            let mtime = filetime::FileTime::from_last_modification_time(&metadata);
            filetime::set_symlink_file_times(&dst, atime, mtime)
                .with_context(|| format!("failed setting timestamps for {:?}", &dst))?;
        }
        if settings.uid || settings.gid {
            event!(Level::DEBUG, "setting uid and gid");
            let uid = if settings.uid {
                Some(metadata.uid())
            } else {
                None
            };
            let gid = if settings.gid {
                Some(metadata.gid())
            } else {
                None
            };
            std::os::unix::fs::lchown(&dst, uid, gid).with_context(|| {
                format!(
                    "cannot set {:?} owner to {:?} and/or group id to {:?}",
                    &dst, &uid, &gid
                )
            })?;
        }
        Ok(())
    })
    .await?
}

/// Applies permissions, then owner and timestamps, of `metadata` to the file at `path`.
///
/// Owner goes before the mode so that chown clearing setuid/setgid bits does not undo the mode.
pub async fn set_file_metadata(
    settings: &Settings,
    metadata: &std::fs::Metadata,
    path: &std::path::Path,
) -> Result<()> {
    let permissions = if settings.mode_mask == 0o7777 {
        metadata.permissions()
    } else {
        std::fs::Permissions::from_mode(metadata.permissions().mode() & settings.mode_mask)
    };
    set_owner_and_time(
        &UserAndTimeSettings {
            time: false,
            ..settings.user_and_time
        },
        path,
        metadata,
    )
    .await?;
    tokio::fs::set_permissions(path, permissions.clone())
        .await
        .with_context(|| format!("cannot set {:?} permissions to {:?}", &path, &permissions))?;
    // timestamps last, anything above may have touched them
    set_owner_and_time(
        &UserAndTimeSettings {
            uid: false,
            gid: false,
            time: settings.user_and_time.time,
        },
        path,
        metadata,
    )
    .await
}

pub fn preserve_all() -> Settings {
    Settings {
        user_and_time: UserAndTimeSettings {
            uid: true,
            gid: true,
            time: true,
        },
        mode_mask: 0o7777,
    }
}

pub fn preserve_default() -> Settings {
    Settings {
        user_and_time: UserAndTimeSettings::default(),
        mode_mask: 0o0777, // remove sticky bit, setuid and setgid to mimic "cp" tool
    }
}
