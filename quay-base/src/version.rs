use crate::manifest::{Manifest, ManifestAsset, ManifestBundle};
use crate::ContentError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One independently-versioned content group. The manifest is carried in its
/// own file (named by `file_name()`) and loaded lazily.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Version {
    pub name: String,
    /// Monotonically increasing per group.
    pub ver: i32,
    pub hash: String,
    pub file: String,
    pub size: u64,
    pub timestamp: i64,

    #[serde(skip)]
    pub manifest: Option<Manifest>,
}

impl Version {
    pub fn file_name(&self) -> String {
        format!("{}_{}.json", self.name.to_lowercase(), self.hash)
    }

    pub fn load_manifest(
        &mut self,
        path: &Path,
    ) -> Result<(), ContentError> {
        self.manifest = Some(Manifest::load_from_file(path)?);
        Ok(())
    }
}

/// The full collection of named versions plus a freshness timestamp. This is
/// the unit of persistence and of local/remote comparison: a fetched remote
/// set is adopted only when strictly newer.
#[derive(Default, Serialize, Deserialize)]
pub struct VersionSet {
    pub timestamp: i64,
    pub data: Vec<Version>,
}

impl VersionSet {
    pub const FILE_NAME: &'static str = "versions.json";

    /// Strictly-newer comparison. Defends against adopting a stale or
    /// out-of-order update.
    pub fn is_newer(
        &self,
        other: &VersionSet,
    ) -> bool {
        self.timestamp > other.timestamp
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<&Version> {
        self.data.iter().find(|v| v.name == name)
    }

    /// Upsert by name. Refreshes the freshness timestamp, which callers may
    /// override afterwards (tests, deterministic builds).
    pub fn set(
        &mut self,
        value: Version,
    ) {
        match self.data.iter_mut().find(|v| v.name == value.name) {
            Some(existing) => *existing = value,
            None => self.data.push(value),
        }

        self.timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
    }

    /// Resolve an asset path. Versions are scanned in registration order and
    /// the first manifest containing the path wins.
    pub fn try_get_asset(
        &self,
        path: &str,
    ) -> Option<(&Manifest, &ManifestAsset)> {
        for version in &self.data {
            let Some(manifest) = version.manifest.as_ref() else {
                continue;
            };
            if let Some(asset) = manifest.try_get_asset(path) {
                return Some((manifest, asset));
            }
        }

        None
    }

    /// Resolve a path that may be a directory grouping multiple assets.
    pub fn try_get_assets(
        &self,
        path: &str,
    ) -> Option<(&Manifest, Vec<&ManifestAsset>)> {
        for version in &self.data {
            let Some(manifest) = version.manifest.as_ref() else {
                continue;
            };
            if manifest.is_directory(path) {
                return Some((manifest, manifest.assets_in_directory(path)));
            }

            if let Some(asset) = manifest.try_get_asset(path) {
                return Some((manifest, vec![asset]));
            }
        }

        None
    }

    pub fn get_bundle(
        &self,
        name: &str,
    ) -> Option<&ManifestBundle> {
        for version in &self.data {
            let Some(manifest) = version.manifest.as_ref() else {
                continue;
            };
            if let Some(bundle) = manifest.get_bundle(name) {
                return Some(bundle);
            }
        }

        None
    }

    pub fn load_from_file(path: &Path) -> Result<VersionSet, ContentError> {
        let json = std::fs::read_to_string(path)?;
        let set: VersionSet = serde_json::from_str(&json)?;
        Ok(set)
    }

    pub fn save_to_file(
        &self,
        path: &Path,
    ) -> Result<(), ContentError> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn file_name(&self) -> String {
        format!("versions_v{}.json", self)
    }
}

impl std::fmt::Display for VersionSet {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let mut versions: Vec<_> = self.data.iter().collect();
        versions.sort_by(|a, b| a.name.cmp(&b.name));
        let joined: Vec<_> = versions.iter().map(|v| v.ver.to_string()).collect();
        write!(f, "{}", joined.join("."))
    }
}
