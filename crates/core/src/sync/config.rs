//! Sync configuration surface.

use serde::{Deserialize, Serialize};

use crate::sync::adapter::ProviderKind;

/// Default debounce window for the immediate-upload debouncer.
pub const DEBOUNCE_MS: u64 = 2000;

/// Default periodic poll interval (ignored for op-sync, which relies on
/// debounced push plus the server sequence).
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebDavCredentials {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub sync_folder_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFileCredentials {
    pub sync_folder_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropboxCredentials {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub sync_folder_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperSyncCredentials {
    pub base_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Android Storage-Access-Framework target, carried opaquely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafCredentials {
    pub tree_uri: String,
}

/// Per-provider credential sub-objects; only the active provider's entry
/// is read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_dav: Option<WebDavCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_file: Option<LocalFileCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropbox: Option<DropboxCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_sync: Option<SuperSyncCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saf: Option<SafCredentials>,
}

/// Master sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub is_enabled: bool,
    pub sync_provider: ProviderKind,
    /// Periodic poll interval in milliseconds.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,
    #[serde(default)]
    pub is_manual_sync_only: bool,
    #[serde(default)]
    pub is_encryption_enabled: bool,
    /// Passphrase at rest; the derived key is never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_key: Option<String>,
    #[serde(default)]
    pub is_compression_enabled: bool,
    #[serde(default)]
    pub credentials: ProviderCredentials,
}

fn default_sync_interval() -> u64 {
    DEFAULT_SYNC_INTERVAL_MS
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            is_enabled: false,
            sync_provider: ProviderKind::LocalFile,
            sync_interval: DEFAULT_SYNC_INTERVAL_MS,
            is_manual_sync_only: false,
            is_encryption_enabled: false,
            encrypt_key: None,
            is_compression_enabled: false,
            credentials: ProviderCredentials::default(),
        }
    }
}
