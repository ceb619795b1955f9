use crate::ContentError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Small descriptor advertising a newer version set: where to fetch it,
/// what it hashes to, and which player version it was built against.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub version: String,
    pub timestamp: i64,
    pub hash: String,
    pub size: u64,
    pub file: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    #[serde(rename = "playerURL")]
    pub player_url: String,
}

impl UpdateInfo {
    pub const FILE_NAME: &'static str = "updateinfo.json";
}

/// Descriptor advertising a newer native-code patch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PatchUpdateInfo {
    /// Monotonically increasing patch version, compared against the locally
    /// recorded baseline.
    pub version: i32,
    pub file: String,
    pub hash: String,
    pub size: u64,
    pub timestamp: i64,
}

impl PatchUpdateInfo {
    pub const FILE_NAME: &'static str = "patch_updateinfo.json";

    pub fn load_from_file(path: &Path) -> Result<PatchUpdateInfo, ContentError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save_to_file(
        &self,
        path: &Path,
    ) -> Result<(), ContentError> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

/// The player version carried by update info and the local config, parsed
/// just far enough for the redirect rule. Not full semver on purpose.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlayerVersion {
    pub major: u32,
    pub minor: u32,
}

impl PlayerVersion {
    pub fn parse(text: &str) -> Option<PlayerVersion> {
        let mut parts = text.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().unwrap_or("0").parse().ok()?;
        Some(PlayerVersion { major, minor })
    }

    /// The redirect rule is deliberately asymmetric: a differing major
    /// always redirects, a remote minor ahead of local redirects, but a
    /// remote minor behind local does not.
    pub fn requires_player_update(
        remote: PlayerVersion,
        local: PlayerVersion,
    ) -> bool {
        remote.major != local.major || remote.minor > local.minor
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_player_version() {
        assert_eq!(
            PlayerVersion::parse("1.2.3"),
            Some(PlayerVersion { major: 1, minor: 2 })
        );
        assert_eq!(
            PlayerVersion::parse("2"),
            Some(PlayerVersion { major: 2, minor: 0 })
        );
        assert_eq!(PlayerVersion::parse("abc"), None);
    }

    #[test]
    fn redirect_rule_is_asymmetric() {
        let local = PlayerVersion { major: 1, minor: 5 };

        // major differs either way
        assert!(PlayerVersion::requires_player_update(
            PlayerVersion { major: 2, minor: 0 },
            local
        ));
        assert!(PlayerVersion::requires_player_update(
            PlayerVersion { major: 0, minor: 9 },
            local
        ));

        // remote minor ahead redirects, behind does not
        assert!(PlayerVersion::requires_player_update(
            PlayerVersion { major: 1, minor: 6 },
            local
        ));
        assert!(!PlayerVersion::requires_player_update(
            PlayerVersion { major: 1, minor: 4 },
            local
        ));
        assert!(!PlayerVersion::requires_player_update(local, local));
    }

    #[test]
    fn update_info_field_names_match_wire_format() {
        let json = r#"{
            "version": "1.2.0",
            "timestamp": 150,
            "hash": "aa",
            "size": 10,
            "file": "versions_v1.2.json",
            "downloadURL": "http://cdn.example.com/content",
            "playerURL": "http://store.example.com/app"
        }"#;

        let info: UpdateInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.download_url, "http://cdn.example.com/content");
        assert_eq!(info.player_url, "http://store.example.com/app");

        let out = serde_json::to_string(&info).unwrap();
        assert!(out.contains("downloadURL"));
        assert!(out.contains("playerURL"));
    }
}
