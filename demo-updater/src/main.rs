//! Self-contained demo of the update flow: publishes a fake CDN into a
//! temp directory, runs a full update pass against it, then loads an asset
//! through the freshly adopted content.

use quay_base::hashing;
use quay_base::{Manifest, ManifestAsset, ManifestBundle, UpdateInfo, Version, VersionSet};
use quay_runtime::{
    AutoConfirm, ContentPaths, ContentRuntime, DirSource, NoopBootstrap, PlayerConfig,
    UpdateOutcome,
};
use std::path::Path;
use std::sync::Arc;

const BASE_URL: &str = "http://cdn.demo";

/// Write a one-version content drop the way a build pipeline would: bundle
/// files named and checksummed by content, a manifest per version, a version
/// set, and the update descriptor pointing at it all.
fn publish_remote(
    remote: &Path,
    timestamp: i64,
) {
    std::fs::create_dir_all(remote).unwrap();

    let assets = [
        ("ui/title.png", b"title pixels".as_slice()),
        ("ui/panel.png", b"panel pixels".as_slice()),
        ("audio/theme.ogg", b"theme samples".as_slice()),
    ];

    let mut bundles = Vec::new();
    let mut manifest_assets = Vec::new();
    for (index, (path, data)) in assets.iter().enumerate() {
        let hash = hashing::content_hash(data);
        let file = format!("bundle_{}_{}.bundle", index, hash);
        std::fs::write(remote.join(&file), data).unwrap();
        bundles.push(ManifestBundle {
            name: format!("bundle_{}", index),
            file,
            size: data.len() as u64,
            hash,
            deps: vec![],
        });
        manifest_assets.push(ManifestAsset {
            path: path.to_string(),
            bundle: index,
        });
    }

    let manifest = Manifest::new(bundles, manifest_assets);
    let manifest_bytes = serde_json::to_vec(&manifest).unwrap();

    let version = Version {
        name: "Main".to_string(),
        ver: 1,
        hash: hashing::content_hash(&manifest_bytes),
        file: String::new(),
        size: manifest_bytes.len() as u64,
        timestamp,
        manifest: None,
    };
    std::fs::write(remote.join(version.file_name()), &manifest_bytes).unwrap();

    let set = VersionSet {
        timestamp,
        data: vec![version],
    };
    let set_bytes = serde_json::to_vec(&set).unwrap();
    let set_file = "versions_remote.json";
    std::fs::write(remote.join(set_file), &set_bytes).unwrap();

    let info = UpdateInfo {
        version: "1.0".to_string(),
        timestamp,
        hash: hashing::content_hash(&set_bytes),
        size: set_bytes.len() as u64,
        file: set_file.to_string(),
        download_url: String::new(),
        player_url: String::new(),
    };
    std::fs::write(
        remote.join(UpdateInfo::FILE_NAME),
        serde_json::to_vec(&info).unwrap(),
    )
    .unwrap();
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    let root = std::env::temp_dir().join("quay-demo-updater");
    let _ = std::fs::remove_dir_all(&root);
    let remote = root.join("cdn");
    publish_remote(&remote, 150);

    let mut config = PlayerConfig::default();
    config.version = "1.0".to_string();
    config.updatable = true;
    config.update_info_url = format!("{}/{}", BASE_URL, UpdateInfo::FILE_NAME);
    config.download_url = BASE_URL.to_string();

    let paths = ContentPaths::under(&root.join("local"));
    let mut runtime = ContentRuntime::new(
        config,
        paths,
        Arc::new(DirSource::new(&remote, BASE_URL)),
        Arc::new(NoopBootstrap::default()),
        Arc::new(AutoConfirm),
    );
    runtime.initialize().unwrap();

    println!("checking for updates...");
    runtime.check_for_updates();
    let outcome = loop {
        std::thread::sleep(std::time::Duration::from_millis(15));
        runtime.update();
        println!(
            "  [{}] {:.0}%",
            runtime.update_state(),
            runtime.update_progress() * 100.0
        );
        if let Some(outcome) = runtime.take_update_outcome() {
            break outcome;
        }
    };

    match outcome {
        UpdateOutcome::Updated { patch_applied } => {
            println!(
                "updated to content {} (patch: {:?})",
                runtime.versions(),
                patch_applied
            );
        }
        other => {
            println!("update finished: {:?}", other);
            return;
        }
    }

    let handle = runtime.acquire("ui/title.png", "bytes", None).unwrap();
    loop {
        std::thread::sleep(std::time::Duration::from_millis(15));
        runtime.update();

        let guard = handle.lock().unwrap();
        if guard.base.is_done() {
            match &guard.payload {
                Some(payload) => println!("ui/title.png loaded, {} bytes", payload.len()),
                None => println!("ui/title.png failed: {:?}", guard.base.error),
            }
            break;
        }
        println!("ui/title.png not loaded");
    }

    runtime.release(&handle);
}
