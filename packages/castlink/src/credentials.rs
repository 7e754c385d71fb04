//! File-backed credential store: the install identity and the bearer token,
//! persisted in `<data_dir>/credentials.toml` with owner-only permissions.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

const CREDENTIALS_FILE: &str = "credentials.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredCredentials {
    /// Generated once per installation; identifies the agent to the auth
    /// callback flow.
    #[serde(default)]
    install_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
}

/// Durable store for the install identity and bearer token.
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<StoredCredentials>,
}

impl CredentialStore {
    /// Load from `<data_dir>/credentials.toml`, generating and persisting an
    /// install id on first use.
    pub fn load_or_init(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CREDENTIALS_FILE);

        let mut stored = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read credentials: {}", path.display()))?;
            toml::from_str::<StoredCredentials>(&raw)
                .with_context(|| format!("invalid credentials file: {}", path.display()))?
        } else {
            StoredCredentials::default()
        };

        if stored.install_id.is_empty() {
            stored.install_id = uuid::Uuid::new_v4().to_string();
            write_credentials(&path, &stored)?;
            info!(install_id = %stored.install_id, "generated install identity");
        }

        Ok(Self {
            path,
            state: Mutex::new(stored),
        })
    }

    pub fn install_id(&self) -> String {
        self.state
            .lock()
            .expect("credential lock poisoned")
            .install_id
            .clone()
    }

    pub fn token(&self) -> Option<String> {
        self.state
            .lock()
            .expect("credential lock poisoned")
            .auth_token
            .clone()
    }

    pub fn set_token(&self, token: &str) -> Result<()> {
        let mut state = self.state.lock().expect("credential lock poisoned");
        state.auth_token = Some(token.to_string());
        write_credentials(&self.path, &state)
    }

    pub fn clear_token(&self) -> Result<()> {
        let mut state = self.state.lock().expect("credential lock poisoned");
        state.auth_token = None;
        write_credentials(&self.path, &state)
    }
}

/// Write the credentials file with mode 0600.
fn write_credentials(path: &Path, stored: &StoredCredentials) -> Result<()> {
    let body = toml::to_string_pretty(stored).context("failed to serialize credentials")?;
    std::fs::write(path, body)
        .with_context(|| format!("failed to write credentials: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}
