//! Application settings management
//!
//! User preferences: volume, anonymity mode, proxy endpoints and where
//! recordings are kept.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use umbra::config::proxy::{DEFAULT_I2P_HOST, DEFAULT_I2P_PORT, DEFAULT_TOR_HOST, DEFAULT_TOR_PORT};
use umbra::recording::{DirectoryStorage, FileStorage, MediaIndexStorage, StorageBackend};
use umbra::routing::{AnonymityPolicy, CustomProxy};

use crate::config::app::SETTINGS_FILE;
use crate::data::storage;
use crate::error::{AppError, Result};

/// Settings file format version for migrations
const SETTINGS_VERSION: u32 = 1;

/// How strictly traffic is forced through a proxy.
///
/// The modes exclude each other, so enabling one replaces the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceMode {
    /// Stations choose their own proxy
    #[default]
    Off,
    /// Everything through Tor, no exceptions
    TorAll,
    /// Everything through Tor except I2P stations
    TorExceptI2p,
    /// Everything through the custom proxy
    CustomProxy,
    /// Clearnet through the custom proxy, Tor and I2P stations native
    CustomProxyExceptTorI2p,
}

/// Where new recordings go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStorage {
    /// `<music dir>/umbra`
    #[default]
    Music,
    /// A media library with an index of entries
    MediaLibrary,
    /// A directory the user picked
    Directory,
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// File format version
    #[serde(default = "default_version")]
    pub version: u32,

    // === Audio ===
    /// Volume level (0.0 - 1.0)
    #[serde(default = "default_volume")]
    pub volume: f32,

    // === Anonymity ===
    #[serde(default)]
    pub force_mode: ForceMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_proxy: Option<CustomProxy>,

    /// Tor SOCKS endpoint that is probed for connectivity
    #[serde(default = "default_tor_host")]
    pub tor_host: String,

    #[serde(default = "default_tor_port")]
    pub tor_port: u16,

    /// I2P HTTP proxy that is probed for availability
    #[serde(default = "default_i2p_host")]
    pub i2p_host: String,

    #[serde(default = "default_i2p_port")]
    pub i2p_port: u16,

    // === Recording ===
    #[serde(default)]
    pub recording_storage: RecordingStorage,

    /// Target for `RecordingStorage::Directory`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_directory: Option<PathBuf>,

    /// Library root for `RecordingStorage::MediaLibrary`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_library: Option<PathBuf>,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_volume() -> f32 {
    0.8
}

fn default_tor_host() -> String {
    DEFAULT_TOR_HOST.to_string()
}

fn default_tor_port() -> u16 {
    DEFAULT_TOR_PORT
}

fn default_i2p_host() -> String {
    DEFAULT_I2P_HOST.to_string()
}

fn default_i2p_port() -> u16 {
    DEFAULT_I2P_PORT
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            volume: default_volume(),
            force_mode: ForceMode::default(),
            custom_proxy: None,
            tor_host: default_tor_host(),
            tor_port: default_tor_port(),
            i2p_host: default_i2p_host(),
            i2p_port: default_i2p_port(),
            recording_storage: RecordingStorage::default(),
            recording_directory: None,
            media_library: None,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from the config directory, defaults if there are none
    pub fn load() -> Result<Self> {
        Ok(storage::load(SETTINGS_FILE)?.unwrap_or_default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        Ok(storage::load_from(path)?.unwrap_or_default())
    }

    pub fn save(&self) -> Result<()> {
        storage::save(SETTINGS_FILE, self)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        storage::save_to(path, self)
    }

    /// Set volume (clamped to 0.0 - 1.0)
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    /// The anonymity policy the routing resolver enforces
    pub fn policy(&self) -> AnonymityPolicy {
        AnonymityPolicy {
            force_all_through_tor: self.force_mode == ForceMode::TorAll,
            force_all_except_i2p_through_tor: self.force_mode == ForceMode::TorExceptI2p,
            force_custom_proxy: self.force_mode == ForceMode::CustomProxy,
            force_custom_proxy_except_tor_i2p: self.force_mode
                == ForceMode::CustomProxyExceptTorI2p,
            custom_proxy: self.custom_proxy.clone(),
        }
    }

    /// Build the storage backend for a new recording
    pub fn storage_backend(&self) -> Result<Arc<dyn StorageBackend>> {
        match self.recording_storage {
            RecordingStorage::Music => Ok(Arc::new(FileStorage::default_location()?)),
            RecordingStorage::MediaLibrary => {
                let root = match &self.media_library {
                    Some(root) => root.clone(),
                    None => FileStorage::default_location()?.dir().join("library"),
                };
                Ok(Arc::new(MediaIndexStorage::new(root)))
            }
            RecordingStorage::Directory => {
                let dir = self.recording_directory.clone().ok_or_else(|| {
                    AppError::Config("No recording directory has been chosen".to_string())
                })?;
                Ok(Arc::new(DirectoryStorage::new(dir)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra::routing::ProxyProtocol;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.version, SETTINGS_VERSION);
        assert_eq!(s.volume, 0.8);
        assert_eq!(s.force_mode, ForceMode::Off);
        assert_eq!(s.tor_port, 9050);
        assert_eq!(s.i2p_port, 4444);
        assert_eq!(s.recording_storage, RecordingStorage::Music);
        assert_eq!(s.policy(), AnonymityPolicy::default());
    }

    #[test]
    fn volume_is_clamped() {
        let mut s = Settings::new();
        s.set_volume(1.5);
        assert_eq!(s.volume, 1.0);
        s.set_volume(-0.5);
        assert_eq!(s.volume, 0.0);
        s.set_volume(0.5);
        assert_eq!(s.volume, 0.5);
    }

    #[test]
    fn each_force_mode_sets_one_flag() {
        let mut s = Settings::new();

        s.force_mode = ForceMode::TorAll;
        let p = s.policy();
        assert!(p.force_all_through_tor);
        assert!(!p.force_all_except_i2p_through_tor && !p.force_custom_proxy);

        s.force_mode = ForceMode::TorExceptI2p;
        let p = s.policy();
        assert!(p.force_all_except_i2p_through_tor);
        assert!(!p.force_all_through_tor);

        s.force_mode = ForceMode::CustomProxy;
        assert!(s.policy().force_custom_proxy);

        s.force_mode = ForceMode::CustomProxyExceptTorI2p;
        let p = s.policy();
        assert!(p.force_custom_proxy_except_tor_i2p);
        assert!(!p.force_custom_proxy);
    }

    #[test]
    fn roundtrip_keeps_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let original = Settings {
            volume: 0.3,
            force_mode: ForceMode::CustomProxyExceptTorI2p,
            custom_proxy: Some(CustomProxy {
                host: "proxy.lan".into(),
                port: 1080,
                protocol: ProxyProtocol::Socks5,
                username: "u".into(),
                password: "p".into(),
                connect_timeout_secs: 20,
                ..CustomProxy::default()
            }),
            tor_host: "10.0.0.5".into(),
            tor_port: 9150,
            i2p_host: "10.0.0.6".into(),
            i2p_port: 4445,
            recording_storage: RecordingStorage::Directory,
            recording_directory: Some(PathBuf::from("/srv/rec")),
            media_library: Some(PathBuf::from("/srv/lib")),
            ..Settings::default()
        };
        original.save_to(&path).unwrap();

        assert_eq!(Settings::load_from(&path).unwrap(), original);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load_from(&dir.path().join("none.json")).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn unknown_and_missing_fields_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "volume": 0.4, "theme": "dark" }"#).unwrap();

        let s = Settings::load_from(&path).unwrap();
        assert_eq!(s.volume, 0.4);
        assert_eq!(s.force_mode, ForceMode::Off);
        assert_eq!(s.tor_host, "127.0.0.1");
    }

    #[test]
    fn directory_storage_needs_a_directory() {
        let mut s = Settings::new();
        s.recording_storage = RecordingStorage::Directory;
        assert!(matches!(s.storage_backend(), Err(AppError::Config(_))));

        let dir = tempfile::tempdir().unwrap();
        s.recording_directory = Some(dir.path().to_path_buf());
        assert_eq!(s.storage_backend().unwrap().name(), "directory");
    }

    #[test]
    fn media_library_uses_configured_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings::new();
        s.recording_storage = RecordingStorage::MediaLibrary;
        s.media_library = Some(dir.path().to_path_buf());
        assert_eq!(s.storage_backend().unwrap().name(), "media-index");
    }
}
