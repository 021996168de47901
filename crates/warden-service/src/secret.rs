//! Shared secret for the control and event socket handshakes.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use std::path::Path;
use tracing::info;

pub const SECRET_LEN: usize = 32;

pub fn load_secret(path: &Path) -> Result<Vec<u8>> {
    let encoded = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("read ipc secret {}: {e}", path.display()))?;
    let decoded = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| anyhow!("decode ipc secret: {e}"))?;
    if decoded.is_empty() {
        return Err(anyhow!("ipc secret is empty"));
    }
    Ok(decoded)
}

/// Reads the secret, generating and storing a fresh one on first run.
pub fn load_or_create_secret(path: &Path) -> Result<Vec<u8>> {
    if path.exists() {
        return load_secret(path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut secret = vec![0u8; SECRET_LEN];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    std::fs::write(path, general_purpose::STANDARD.encode(&secret))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!(path = %path.display(), "ipc secret created");
    Ok(secret)
}
