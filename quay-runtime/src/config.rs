use quay_base::ContentError;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_max_downloads() -> usize {
    10
}

fn default_max_retry_times() -> u32 {
    3
}

fn default_auto_slicing() -> bool {
    true
}

fn default_auto_slice_timestep_ms() -> u64 {
    1
}

fn default_auto_recycle_timestep_ms() -> u64 {
    700
}

fn default_native_lib_name() -> String {
    "libil2cpp.so".to_string()
}

/// Build-time settings shipped inside the player. Loaded once at startup;
/// everything here can be overridden per build without recompiling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Player version as "major.minor" (optionally "major.minor.patch").
    #[serde(default)]
    pub version: String,
    /// Master switch for the update flow. When off, initialize still reads
    /// local content but check_for_updates reports up to date immediately.
    #[serde(default)]
    pub updatable: bool,
    #[serde(default, rename = "updateInfoURL")]
    pub update_info_url: String,
    #[serde(default, rename = "downloadURL")]
    pub download_url: String,
    #[serde(default, rename = "patchUpdateInfoURL")]
    pub patch_update_info_url: String,
    /// Patch level baked into this binary. A remote patch at or below this
    /// level is already applied.
    #[serde(default)]
    pub patch_version: i32,
    #[serde(default = "default_max_downloads")]
    pub max_downloads: usize,
    #[serde(default = "default_max_retry_times")]
    pub max_retry_times: u32,
    /// Per-kind cap on requests admitted to processing. 0 means unbounded.
    #[serde(default)]
    pub max_requests: usize,
    #[serde(default = "default_auto_slicing")]
    pub auto_slicing: bool,
    #[serde(default = "default_auto_slice_timestep_ms")]
    pub auto_slice_timestep_ms: u64,
    #[serde(default = "default_auto_recycle_timestep_ms")]
    pub auto_recycle_timestep_ms: u64,
    #[serde(default = "default_native_lib_name")]
    pub native_lib_name: String,
}

impl Default for PlayerConfig {
    fn default() -> PlayerConfig {
        PlayerConfig {
            version: "1.0".to_string(),
            updatable: false,
            update_info_url: String::default(),
            download_url: String::default(),
            patch_update_info_url: String::default(),
            patch_version: 0,
            max_downloads: default_max_downloads(),
            max_retry_times: default_max_retry_times(),
            max_requests: 0,
            auto_slicing: default_auto_slicing(),
            auto_slice_timestep_ms: default_auto_slice_timestep_ms(),
            auto_recycle_timestep_ms: default_auto_recycle_timestep_ms(),
            native_lib_name: default_native_lib_name(),
        }
    }
}

impl PlayerConfig {
    pub const FILE_NAME: &'static str = "playerconfig.json";

    pub fn load_from_file(path: &Path) -> Result<PlayerConfig, ContentError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save_to_file(
        &self,
        path: &Path,
    ) -> Result<(), ContentError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: PlayerConfig = serde_json::from_str(
            r#"{"version": "2.1", "updatable": true, "updateInfoURL": "http://cdn.test/updateinfo.json"}"#,
        )
        .unwrap();

        assert_eq!(config.version, "2.1");
        assert!(config.updatable);
        assert_eq!(config.update_info_url, "http://cdn.test/updateinfo.json");
        assert_eq!(config.max_downloads, 10);
        assert_eq!(config.max_retry_times, 3);
        assert_eq!(config.auto_slice_timestep_ms, 1);
        assert_eq!(config.native_lib_name, "libil2cpp.so");
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PlayerConfig::FILE_NAME);

        let mut config = PlayerConfig::default();
        config.version = "3.0".to_string();
        config.patch_version = 4;
        config.save_to_file(&path).unwrap();

        let loaded = PlayerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.version, "3.0");
        assert_eq!(loaded.patch_version, 4);
    }
}
