use crate::cache::{BundleContentHandler, ContentCache, LoadRequest};
use crate::config::PlayerConfig;
use crate::download::DownloadRequest;
use crate::patch::Bootstrap;
use crate::request::{Callback, SharedRequest};
use crate::requests::Prompter;
use crate::scheduler::Scheduler;
use crate::source::ContentSource;
use crate::updater::{UpdateOutcome, Updater, UpdaterPoll};
use quay_base::{ContentError, PatchUpdateInfo, VersionSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where the runtime keeps its content on the local machine. The player
/// directory ships read-only with the install; everything else lives under a
/// writable root.
#[derive(Clone)]
pub struct ContentPaths {
    /// Content shipped inside the install image, read-only.
    pub player_dir: PathBuf,
    /// Downloaded content; shadows the player directory.
    pub download_dir: PathBuf,
    /// Unpacked native patches, one subdirectory per patch version.
    pub patch_root: PathBuf,
    /// Caches derived from native code, wiped when a patch lands.
    pub derived_cache_dir: PathBuf,
}

impl ContentPaths {
    pub fn under(root: &Path) -> ContentPaths {
        ContentPaths {
            player_dir: root.join("player"),
            download_dir: root.join("download"),
            patch_root: root.join("patches"),
            derived_cache_dir: root.join("derived_cache"),
        }
    }
}

/// Facade over the whole content layer: one scheduler ticked from the host's
/// frame loop, the load cache, the adopted version set, and at most one
/// update pass in flight.
pub struct ContentRuntime {
    config: PlayerConfig,
    paths: ContentPaths,
    versions: VersionSet,
    scheduler: Scheduler,
    cache: ContentCache,
    source: Arc<dyn ContentSource>,
    bootstrap: Arc<dyn Bootstrap>,
    prompter: Arc<dyn Prompter>,
    updater: Option<Updater>,
    last_outcome: Option<UpdateOutcome>,
    last_maintain: Instant,
}

impl ContentRuntime {
    pub fn new(
        config: PlayerConfig,
        paths: ContentPaths,
        source: Arc<dyn ContentSource>,
        bootstrap: Arc<dyn Bootstrap>,
        prompter: Arc<dyn Prompter>,
    ) -> ContentRuntime {
        let mut scheduler = Scheduler::new(
            Duration::from_millis(config.auto_slice_timestep_ms),
            config.max_requests,
        );
        scheduler.auto_slicing = config.auto_slicing;
        scheduler.set_kind_limit(DownloadRequest::KIND, config.max_downloads);

        let cache = ContentCache::new(BundleContentHandler::factory(vec![
            paths.download_dir.clone(),
            paths.player_dir.clone(),
        ]));

        ContentRuntime {
            config,
            paths,
            versions: VersionSet::default(),
            scheduler,
            cache,
            source,
            bootstrap,
            prompter,
            updater: None,
            last_outcome: None,
            last_maintain: Instant::now(),
        }
    }

    /// Load the locally adopted version set and its manifests.
    /// Downloaded content wins over the shipped image; a player with neither
    /// starts empty and relies on an update pass.
    pub fn initialize(&mut self) -> Result<(), ContentError> {
        match self.load_local_versions(&self.paths.download_dir) {
            Ok(Some(versions)) => {
                log::info!("using downloaded content {}", versions);
                self.versions = versions;
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => log::warn!("downloaded version set unusable: {}", e),
        }

        match self.load_local_versions(&self.paths.player_dir) {
            Ok(Some(versions)) => {
                log::info!("using shipped content {}", versions);
                self.versions = versions;
                Ok(())
            }
            Ok(None) => {
                log::info!("no local content, waiting for first update");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn load_local_versions(
        &self,
        dir: &Path,
    ) -> Result<Option<VersionSet>, ContentError> {
        let path = dir.join(VersionSet::FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }

        let mut versions = VersionSet::load_from_file(&path)?;
        for version in &mut versions.data {
            let file = version.file_name();
            let candidate = [&self.paths.download_dir, &self.paths.player_dir]
                .into_iter()
                .map(|root| root.join(&file))
                .find(|p| p.exists())
                .ok_or_else(|| ContentError::NotFound(file.clone()))?;
            version.load_manifest(&candidate)?;
        }

        Ok(Some(versions))
    }

    /// The locally recorded patch baseline: the level baked into the binary
    /// or the last applied patch, whichever is higher.
    fn patch_baseline(&self) -> i32 {
        let recorded = self.paths.download_dir.join(PatchUpdateInfo::FILE_NAME);
        let recorded = PatchUpdateInfo::load_from_file(&recorded)
            .map(|info| info.version)
            .unwrap_or(0);
        self.config.patch_version.max(recorded)
    }

    /// Begin an update pass unless one is already running. The pass is
    /// driven by subsequent `update` calls; its result lands in
    /// `take_update_outcome`.
    pub fn check_for_updates(&mut self) {
        if self.updater.is_some() {
            return;
        }

        self.last_outcome = None;
        self.updater = Some(Updater::new(
            self.config.clone(),
            self.paths.clone(),
            self.source.clone(),
            self.bootstrap.clone(),
            self.prompter.clone(),
            self.versions.timestamp,
            self.patch_baseline(),
        ));
    }

    /// Per-frame drive: tick the scheduler, run cache maintenance on its own
    /// timestep, and advance any update pass in flight.
    #[profiling::function]
    pub fn update(&mut self) {
        self.scheduler.tick();

        if self.last_maintain.elapsed()
            >= Duration::from_millis(self.config.auto_recycle_timestep_ms)
        {
            let budget = self.scheduler.begin_budget();
            self.cache.maintain(&budget);
            self.last_maintain = Instant::now();
        }

        if let Some(updater) = &mut self.updater {
            match updater.update(&mut self.scheduler) {
                UpdaterPoll::Busy => {}
                UpdaterPoll::Commit(versions) => {
                    // Adoption point: every acquire from here on resolves
                    // through the new set. Already loaded content is
                    // untouched until released and recycled.
                    self.versions = versions;
                }
                UpdaterPoll::Done(outcome) => {
                    self.last_outcome = Some(outcome);
                    self.updater = None;
                }
            }
        }
    }

    pub fn is_updating(&self) -> bool {
        self.updater.is_some()
    }

    pub fn update_progress(&self) -> f32 {
        self.updater.as_ref().map(|u| u.progress()).unwrap_or(1.0)
    }

    pub fn update_state(&self) -> &'static str {
        self.updater
            .as_ref()
            .map(|u| u.state_name())
            .unwrap_or("idle")
    }

    pub fn take_update_outcome(&mut self) -> Option<UpdateOutcome> {
        self.last_outcome.take()
    }

    pub fn acquire(
        &mut self,
        path: &str,
        content_type: &'static str,
        callback: Option<Callback>,
    ) -> Result<SharedRequest<LoadRequest>, ContentError> {
        self.cache
            .acquire(&self.versions, &mut self.scheduler, path, content_type, callback)
    }

    pub fn release(
        &mut self,
        handle: &SharedRequest<LoadRequest>,
    ) {
        self.cache.release(handle);
    }

    pub fn versions(&self) -> &VersionSet {
        &self.versions
    }

    pub fn working(&self) -> bool {
        self.scheduler.working()
    }
}
