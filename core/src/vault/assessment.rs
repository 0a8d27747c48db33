use serde::Serialize;

use super::keystore::StorageBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityLevel {
    High,
    Medium,
    Low,
    Unknown,
}

/// Derived at start-up from the keystore actually in use; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityAssessment {
    pub platform: String,
    pub storage_backend: StorageBackend,
    pub security_level: SecurityLevel,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl SecurityAssessment {
    pub fn is_degraded(&self) -> bool {
        matches!(self.security_level, SecurityLevel::Low | SecurityLevel::Unknown)
    }
}

pub fn assess(backend: StorageBackend) -> SecurityAssessment {
    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();
    let security_level = match backend {
        StorageBackend::MacosKeychain | StorageBackend::WindowsCredentialManager => {
            SecurityLevel::High
        }
        StorageBackend::LinuxSecretService => {
            warnings.push(
                "secrets depend on the desktop session keyring being unlocked".to_string(),
            );
            recommendations
                .push("keep gnome-keyring or KWallet unlocked at login".to_string());
            SecurityLevel::Medium
        }
        StorageBackend::Basic => {
            warnings.push(
                "no OS secret store is available; the vault key is protected only by file permissions"
                    .to_string(),
            );
            recommendations.push("install and unlock an OS secret service".to_string());
            recommendations
                .push("keep the workspace directory private to your user account".to_string());
            SecurityLevel::Low
        }
        StorageBackend::Unknown => {
            warnings.push("secret storage on this platform has not been verified".to_string());
            SecurityLevel::Unknown
        }
    };

    SecurityAssessment {
        platform: std::env::consts::OS.to_string(),
        storage_backend: backend,
        security_level,
        warnings,
        recommendations,
    }
}
