//! Persisted device identity. The peer ID must survive restarts — friends
//! key their lists on it — so the secret key lives on disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use peertalk_core::Keypair;
use tracing::info;

/// Default key location under the user's config dir.
pub fn default_path() -> PathBuf {
    match std::env::var_os("HOME").map(PathBuf::from) {
        Some(h) => h.join(".config/peertalk/identity.key"),
        None => PathBuf::from("/etc/peertalk/identity.key"),
    }
}

/// Restore the keypair from `path`, or generate and persist a new one.
pub fn load_or_generate(path: &Path) -> anyhow::Result<Keypair> {
    if path.exists() {
        let bytes = fs::read(path)
            .with_context(|| format!("reading identity key {}", path.display()))?;
        if bytes.len() != 32 {
            bail!(
                "identity key {} has {} bytes, expected 32",
                path.display(),
                bytes.len()
            );
        }
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&bytes);
        return Ok(Keypair::from_secret_bytes(secret));
    }

    let keypair = Keypair::generate();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating identity dir {}", dir.display()))?;
    }
    fs::write(path, keypair.secret_bytes())
        .with_context(|| format!("writing identity key {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    info!(peer = %keypair.peer_id(), "generated new device identity");
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("peertalk-test-{name}-{}-{nanos}", std::process::id()))
    }

    #[test]
    fn identity_survives_restart() {
        let path = scratch_path("identity");
        let first = load_or_generate(&path).unwrap();
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupt_key_is_an_error() {
        let path = scratch_path("corrupt");
        fs::write(&path, b"short").unwrap();
        assert!(load_or_generate(&path).is_err());
        let _ = fs::remove_file(&path);
    }
}
