use quay_base::ContentError;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

/// Host hooks for native code hot-swap. The runtime verifies a patch on disk
/// first and only then asks the host to point its native loader at the new
/// directory; a rejected or corrupt patch never reaches the host.
pub trait Bootstrap: Send + Sync {
    /// ABI of the running process, e.g. "arm64-v8a".
    fn current_abi(&self) -> &str;

    /// Redirect the native loader to `patch_dir`, falling back to
    /// `fallback_dir` (the install image) for anything the patch lacks.
    fn select_patch_directory(
        &self,
        patch_dir: &Path,
        fallback_dir: &Path,
    ) -> Result<(), String>;
}

/// Hook implementation for hosts with no native hot-swap (desktop players,
/// tests). Reports a fixed ABI and accepts any directory.
pub struct NoopBootstrap {
    abi: String,
}

impl NoopBootstrap {
    pub fn new(abi: impl Into<String>) -> NoopBootstrap {
        NoopBootstrap { abi: abi.into() }
    }
}

impl Default for NoopBootstrap {
    fn default() -> NoopBootstrap {
        NoopBootstrap::new("arm64-v8a")
    }
}

impl Bootstrap for NoopBootstrap {
    fn current_abi(&self) -> &str {
        &self.abi
    }

    fn select_patch_directory(
        &self,
        patch_dir: &Path,
        _fallback_dir: &Path,
    ) -> Result<(), String> {
        log::debug!("patch directory selected: {}", patch_dir.display());
        Ok(())
    }
}

fn extract_zip(
    bytes: &[u8],
    dest: &Path,
) -> Result<(), ContentError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ContentError::CorruptPatch(e.to_string()))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ContentError::CorruptPatch(e.to_string()))?;

        // enclosed_name rejects paths escaping the destination
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            return Err(ContentError::CorruptPatch(format!(
                "unsafe path {} in archive",
                entry.name()
            )));
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| ContentError::CorruptPatch(e.to_string()))?;
        std::fs::write(&out_path, data)?;
    }

    Ok(())
}

/// Name of the per-ABI inner archive a patch must carry for this process.
fn inner_archive_name(
    abi: &str,
    native_lib_name: &str,
) -> String {
    format!("lib_{}_{}.zip", abi, native_lib_name)
}

/// Unpacks a verified patch archive into a fresh directory. The outer
/// archive holds one inner archive per ABI; the inner archive for the
/// running ABI is required and is unpacked in place. A patch missing the
/// current ABI is corrupt, and the directory is left behind only on full
/// success, so a crashed apply can never be mistaken for an applied patch.
pub fn apply_patch(
    archive: &[u8],
    patch_dir: &Path,
    abi: &str,
    native_lib_name: &str,
) -> Result<PathBuf, ContentError> {
    if patch_dir.exists() {
        std::fs::remove_dir_all(patch_dir)?;
    }

    let staging = patch_dir.with_extension("staging");
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    extract_zip(archive, &staging)?;

    let inner_name = inner_archive_name(abi, native_lib_name);
    let inner_path = staging.join(&inner_name);
    if !inner_path.exists() {
        std::fs::remove_dir_all(&staging)?;
        return Err(ContentError::CorruptPatch(format!(
            "patch has no archive for abi {} ({})",
            abi, inner_name
        )));
    }

    let inner_bytes = std::fs::read(&inner_path)?;
    extract_zip(&inner_bytes, &staging)?;
    std::fs::remove_file(&inner_path)?;

    std::fs::rename(&staging, patch_dir)?;
    log::info!("patch unpacked to {}", patch_dir.display());
    Ok(patch_dir.to_path_buf())
}

/// Deletes caches derived from the previous native code (script metadata,
/// jit artifacts). Safe to call when the directory does not exist.
pub fn invalidate_derived_cache(dir: &Path) -> Result<(), ContentError> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
        log::info!("derived cache invalidated: {}", dir.display());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(*name, FileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    pub fn patch_archive(
        abi: &str,
        native_lib_name: &str,
        lib_data: &[u8],
    ) -> Vec<u8> {
        let inner = zip_bytes(&[(native_lib_name, lib_data)]);
        zip_bytes(&[(
            inner_archive_name(abi, native_lib_name).as_str(),
            inner.as_slice(),
        )])
    }

    #[test]
    fn apply_unpacks_the_matching_abi() {
        let dir = tempfile::tempdir().unwrap();
        let patch_dir = dir.path().join("patch_v5");
        let archive = patch_archive("arm64-v8a", "libil2cpp.so", b"new native code");

        let applied = apply_patch(&archive, &patch_dir, "arm64-v8a", "libil2cpp.so").unwrap();
        assert_eq!(applied, patch_dir);
        assert_eq!(
            std::fs::read(patch_dir.join("libil2cpp.so")).unwrap(),
            b"new native code"
        );
        // the inner archive is consumed, not left behind
        assert!(!patch_dir
            .join(inner_archive_name("arm64-v8a", "libil2cpp.so"))
            .exists());
    }

    #[test]
    fn missing_abi_archive_is_corrupt_and_leaves_no_directory() {
        let dir = tempfile::tempdir().unwrap();
        let patch_dir = dir.path().join("patch_v5");
        let archive = patch_archive("x86_64", "libil2cpp.so", b"wrong abi");

        let result = apply_patch(&archive, &patch_dir, "arm64-v8a", "libil2cpp.so");
        assert!(matches!(result, Err(ContentError::CorruptPatch(_))));
        assert!(!patch_dir.exists());
    }

    #[test]
    fn reapply_replaces_a_previous_patch() {
        let dir = tempfile::tempdir().unwrap();
        let patch_dir = dir.path().join("patch_v5");

        let old = patch_archive("arm64-v8a", "libil2cpp.so", b"v5");
        apply_patch(&old, &patch_dir, "arm64-v8a", "libil2cpp.so").unwrap();

        let new = patch_archive("arm64-v8a", "libil2cpp.so", b"v6");
        apply_patch(&new, &patch_dir, "arm64-v8a", "libil2cpp.so").unwrap();
        assert_eq!(std::fs::read(patch_dir.join("libil2cpp.so")).unwrap(), b"v6");
    }

    #[test]
    fn invalidate_removes_the_cache_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("il2cpp_cache");
        std::fs::create_dir_all(cache.join("nested")).unwrap();
        std::fs::write(cache.join("nested/blob.bin"), b"stale").unwrap();

        invalidate_derived_cache(&cache).unwrap();
        assert!(!cache.exists());

        // absent directory is fine
        invalidate_derived_cache(&cache).unwrap();
    }
}
