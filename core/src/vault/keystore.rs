//! Where the vault master key lives.
//!
//! Preferred: the OS secret store through `keyring`. When that is missing
//! or refuses to work (headless Linux, WSL, CI) the key goes to a `0600`
//! file in the workspace instead, which is the "basic" storage mode.
//!
//! Everything here is blocking; callers hop onto the blocking pool.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use zeroize::Zeroizing;

use super::cipher::{SecretCipher, KEY_LEN};
use crate::errors::VaultError;

const SERVICE_NAME: &str = "Clipwise";
const MASTER_KEY_ACCOUNT: &str = "vault-master-key";
const KEY_FILE: &str = "vault.key";
/// Set to `basic` to skip the OS secret store.
pub const BACKEND_ENV: &str = "CLIPWISE_VAULT_BACKEND";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    MacosKeychain,
    WindowsCredentialManager,
    LinuxSecretService,
    Basic,
    Unknown,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MacosKeychain => "macos-keychain",
            Self::WindowsCredentialManager => "windows-credential-manager",
            Self::LinuxSecretService => "linux-secret-service",
            Self::Basic => "basic",
            Self::Unknown => "unknown",
        }
    }

    /// The OS secret store this build would use, if any.
    pub fn native() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacosKeychain
        } else if cfg!(target_os = "windows") {
            Self::WindowsCredentialManager
        } else if cfg!(target_os = "linux") {
            Self::LinuxSecretService
        } else {
            Self::Unknown
        }
    }
}

pub trait MasterKeyStore: Send + Sync {
    fn backend(&self) -> StorageBackend;

    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError>;

    fn save(&self, key: &[u8]) -> Result<(), VaultError>;
}

/// Read the master key, creating and persisting one on first use.
pub fn load_or_create(store: &dyn MasterKeyStore) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    if let Some(key) = store.load()? {
        if key.len() == KEY_LEN {
            return Ok(key);
        }
        return Err(VaultError::Keystore(format!(
            "stored master key in {} is malformed",
            store.backend().as_str()
        )));
    }
    let key = SecretCipher::generate_key();
    store.save(&key)?;
    log::info!("created vault master key in {}", store.backend().as_str());
    Ok(key)
}

/// OS secret store via `keyring`.
#[derive(Debug, Clone)]
pub struct SystemKeyring {
    service: String,
    account: String,
}

impl SystemKeyring {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            account: MASTER_KEY_ACCOUNT.to_string(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, VaultError> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|err| VaultError::Keystore(format!("failed to open keyring entry: {err}")))
    }
}

impl Default for SystemKeyring {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterKeyStore for SystemKeyring {
    fn backend(&self) -> StorageBackend {
        StorageBackend::native()
    }

    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
        match self.entry()?.get_secret() {
            Ok(secret) => Ok(Some(Zeroizing::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(VaultError::Keystore(format!("failed to read keyring: {err}"))),
        }
    }

    fn save(&self, key: &[u8]) -> Result<(), VaultError> {
        self.entry()?
            .set_secret(key)
            .map_err(|err| VaultError::Keystore(format!("failed to write keyring: {err}")))
    }
}

/// Master key in a private file. Protected only by file permissions.
#[derive(Debug, Clone)]
pub struct FileKeystore {
    path: PathBuf,
}

impl FileKeystore {
    pub fn in_workspace(workspace_dir: &Path) -> Self {
        Self {
            path: workspace_dir.join(KEY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(context: &str, err: io::Error) -> VaultError {
        VaultError::Keystore(format!("{context}: {err}"))
    }
}

impl MasterKeyStore for FileKeystore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Basic
    }

    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_error("failed to read key file", err)),
        }
    }

    fn save(&self, key: &[u8]) -> Result<(), VaultError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| Self::io_error("failed to create key directory", err))?;
        }
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, key).map_err(|err| Self::io_error("failed to write key file", err))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600))
                .map_err(|err| Self::io_error("failed to restrict key file", err))?;
        }

        fs::rename(&temp_path, &self.path)
            .map_err(|err| Self::io_error("failed to move key file into place", err))
    }
}

/// Whether this machine is expected to have a usable OS secret store.
pub fn system_keyring_expected() -> bool {
    if std::env::var(BACKEND_ENV)
        .map(|v| v.eq_ignore_ascii_case("basic"))
        .unwrap_or(false)
    {
        return false;
    }
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        return true;
    }
    if cfg!(target_os = "linux") {
        return !is_wsl() && std::env::var("DBUS_SESSION_BUS_ADDRESS").is_ok();
    }
    false
}

fn is_wsl() -> bool {
    if let Ok(version) = fs::read_to_string("/proc/version") {
        if version.contains("Microsoft") || version.contains("WSL") {
            return true;
        }
    }
    std::env::var("WSL_DISTRO_NAME").is_ok()
}

/// Outcome of picking a keystore at start-up.
pub struct SelectedKeystore {
    pub store: Box<dyn MasterKeyStore>,
    pub key: Zeroizing<Vec<u8>>,
    /// Why the OS secret store was passed over, when it was.
    pub fallback_reason: Option<String>,
}

/// Try the OS secret store and fall back to the key file.
///
/// The fallback keeps the vault usable; callers surface `fallback_reason`
/// as a security warning.
pub fn select(workspace_dir: &Path) -> Result<SelectedKeystore, VaultError> {
    let fallback_reason = if system_keyring_expected() {
        let system = SystemKeyring::new();
        match load_or_create(&system) {
            Ok(key) => {
                return Ok(SelectedKeystore {
                    store: Box::new(system),
                    key,
                    fallback_reason: None,
                })
            }
            Err(err) => {
                log::warn!("system keyring unusable, falling back to key file: {err}");
                err.to_string()
            }
        }
    } else {
        "no OS secret store detected".to_string()
    };

    let file = FileKeystore::in_workspace(workspace_dir);
    let key = load_or_create(&file)?;
    Ok(SelectedKeystore {
        store: Box::new(file),
        key,
        fallback_reason: Some(fallback_reason),
    })
}
