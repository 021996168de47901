use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "warden";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("WARDEN_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_store_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("config.blobs"))
}

pub fn secret_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("ipc.secret"))
}

pub fn control_socket_path() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("WARDEN_CONTROL_SOCKET") {
        return Ok(PathBuf::from(override_path));
    }
    Ok(data_dir()?.join("control.sock"))
}

pub fn event_socket_path() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("WARDEN_EVENT_SOCKET") {
        return Ok(PathBuf::from(override_path));
    }
    Ok(data_dir()?.join("events.sock"))
}
