use crate::hashing::HashMap;
use crate::hashing::HashSet;
use crate::ContentError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An immutable, content-addressed binary package of one or more assets.
/// The name usually carries a content hash, so a bundle file on disk never
/// changes once produced.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ManifestBundle {
    pub name: String,
    pub file: String,
    pub size: u64,
    pub hash: String,
    /// Names of bundles that must be present before this one can be used.
    #[serde(default)]
    pub deps: Vec<String>,
}

/// One asset entry: a logical path mapped to the index of the bundle that
/// contains it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestAsset {
    pub path: String,
    pub bundle: usize,
}

/// Per-version index mapping asset paths to bundles and bundle dependency
/// edges. Immutable per version; the lookup tables are rebuilt after
/// deserialization rather than persisted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub bundles: Vec<ManifestBundle>,
    pub assets: Vec<ManifestAsset>,

    #[serde(skip)]
    asset_lookup: HashMap<String, usize>,
    #[serde(skip)]
    bundle_lookup: HashMap<String, usize>,
    #[serde(skip)]
    directories: HashSet<String>,
}

impl Manifest {
    pub fn new(
        bundles: Vec<ManifestBundle>,
        assets: Vec<ManifestAsset>,
    ) -> Manifest {
        let mut manifest = Manifest {
            bundles,
            assets,
            ..Default::default()
        };
        manifest.rebuild_lookups();
        manifest
    }

    /// Rebuild the serde-skipped lookup tables. Must be called after
    /// deserializing or mutating `bundles`/`assets`.
    pub fn rebuild_lookups(&mut self) {
        self.asset_lookup = HashMap::default();
        self.bundle_lookup = HashMap::default();
        self.directories = HashSet::default();

        for (index, bundle) in self.bundles.iter().enumerate() {
            self.bundle_lookup.insert(bundle.name.clone(), index);
        }

        for (index, asset) in self.assets.iter().enumerate() {
            self.asset_lookup.insert(asset.path.clone(), index);

            // Register every ancestor prefix so directory queries are O(1)
            let mut prefix = asset.path.as_str();
            while let Some(separator) = prefix.rfind('/') {
                prefix = &prefix[..separator];
                self.directories.insert(prefix.to_string());
            }
        }
    }

    pub fn try_get_asset(
        &self,
        path: &str,
    ) -> Option<&ManifestAsset> {
        self.asset_lookup.get(path).map(|&i| &self.assets[i])
    }

    /// A path is a "directory" when it groups assets under it rather than
    /// naming one directly.
    pub fn is_directory(
        &self,
        path: &str,
    ) -> bool {
        self.directories.contains(path)
    }

    pub fn assets_in_directory(
        &self,
        path: &str,
    ) -> Vec<&ManifestAsset> {
        if !self.is_directory(path) {
            return Vec::default();
        }

        let prefix = format!("{}/", path);
        self.assets
            .iter()
            .filter(|asset| asset.path.starts_with(&prefix))
            .collect()
    }

    pub fn get_bundle(
        &self,
        name: &str,
    ) -> Option<&ManifestBundle> {
        self.bundle_lookup.get(name).map(|&i| &self.bundles[i])
    }

    pub fn bundle_for_asset(
        &self,
        asset: &ManifestAsset,
    ) -> &ManifestBundle {
        &self.bundles[asset.bundle]
    }

    /// The bundle plus the transitive closure of its dependencies, in
    /// discovery order starting with the bundle itself.
    pub fn bundles_with_deps(
        &self,
        name: &str,
    ) -> Vec<&ManifestBundle> {
        let mut result = Vec::default();
        let mut visited = HashSet::default();
        let mut pending = vec![name.to_string()];

        while let Some(next) = pending.pop() {
            if !visited.insert(next.clone()) {
                continue;
            }

            if let Some(bundle) = self.get_bundle(&next) {
                for dep in &bundle.deps {
                    pending.push(dep.clone());
                }
                result.push(bundle);
            }
        }

        result
    }

    pub fn load_from_file(path: &Path) -> Result<Manifest, ContentError> {
        let json = std::fs::read_to_string(path)?;
        let mut manifest: Manifest = serde_json::from_str(&json)?;
        manifest.rebuild_lookups();
        Ok(manifest)
    }

    pub fn save_to_file(
        &self,
        path: &Path,
    ) -> Result<(), ContentError> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_manifest() -> Manifest {
        Manifest::new(
            vec![
                ManifestBundle {
                    name: "shared_ab12".to_string(),
                    file: "shared_ab12.bundle".to_string(),
                    size: 100,
                    hash: "ab12".to_string(),
                    deps: vec![],
                },
                ManifestBundle {
                    name: "ui_cd34".to_string(),
                    file: "ui_cd34.bundle".to_string(),
                    size: 200,
                    hash: "cd34".to_string(),
                    deps: vec!["shared_ab12".to_string()],
                },
            ],
            vec![
                ManifestAsset {
                    path: "ui/title.png".to_string(),
                    bundle: 1,
                },
                ManifestAsset {
                    path: "ui/icons/back.png".to_string(),
                    bundle: 1,
                },
                ManifestAsset {
                    path: "fonts/main.ttf".to_string(),
                    bundle: 0,
                },
            ],
        )
    }

    #[test]
    fn asset_and_bundle_lookup() {
        let manifest = test_manifest();
        let asset = manifest.try_get_asset("ui/title.png").unwrap();
        assert_eq!(manifest.bundle_for_asset(asset).name, "ui_cd34");
        assert!(manifest.try_get_asset("ui/missing.png").is_none());
        assert_eq!(manifest.get_bundle("shared_ab12").unwrap().size, 100);
    }

    #[test]
    fn directory_queries() {
        let manifest = test_manifest();
        assert!(manifest.is_directory("ui"));
        assert!(manifest.is_directory("ui/icons"));
        assert!(!manifest.is_directory("ui/title.png"));

        // "ui" groups both the direct child and the nested one
        let assets = manifest.assets_in_directory("ui");
        assert_eq!(assets.len(), 2);

        let nested = manifest.assets_in_directory("ui/icons");
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].path, "ui/icons/back.png");
    }

    #[test]
    fn dependency_closure() {
        let manifest = test_manifest();
        let bundles = manifest.bundles_with_deps("ui_cd34");
        let names: Vec<_> = bundles.iter().map(|b| b.name.as_str()).collect();
        assert!(names.contains(&"ui_cd34"));
        assert!(names.contains(&"shared_ab12"));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn cloned_manifest_keeps_lookups() {
        // Version carries its manifest by value, so clones must keep the
        // rebuilt tables intact
        let cloned = test_manifest().clone();
        assert!(cloned.try_get_asset("ui/title.png").is_some());
        assert!(cloned.is_directory("ui/icons"));
        assert_eq!(cloned.get_bundle("ui_cd34").unwrap().size, 200);
    }

    #[test]
    fn roundtrip_rebuilds_lookups() {
        let manifest = test_manifest();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        manifest.save_to_file(&path).unwrap();

        let loaded = Manifest::load_from_file(&path).unwrap();
        assert!(loaded.try_get_asset("fonts/main.ttf").is_some());
        assert!(loaded.is_directory("fonts"));
    }
}
