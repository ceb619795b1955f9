use crate::config::PlayerConfig;
use crate::download::{DownloadBatch, DownloadRequest};
use crate::patch::{apply_patch, invalidate_derived_cache, Bootstrap};
use crate::request::{self, SharedRequest};
use crate::requests::{
    GetPatchUpdateInfoRequest, GetUpdateInfoRequest, GetVersionSetRequest, MessageRequest,
    PatchDownloadRequest, Prompter, ReloadRequest, RemoveFilesRequest, NOTHING_TO_UPDATE,
};
use crate::runtime::ContentPaths;
use crate::scheduler::Scheduler;
use crate::source::ContentSource;
use quay_base::hashing::{self, HashSet};
use quay_base::{ContentError, PatchUpdateInfo, PlayerVersion, UpdateInfo, VersionSet};
use std::sync::Arc;

/// Terminal result of one update pass.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// Nothing newer was available, locally adopted content stands.
    UpToDate,
    /// New content was committed and/or a native patch applied.
    Updated { patch_applied: Option<i32> },
    /// The remote content requires a newer player binary.
    RedirectRequired { player_url: String },
    /// The user declined a prompt mid-flow.
    Aborted,
    Failed(ContentError),
}

/// What one poll of the updater produced.
pub enum UpdaterPoll {
    Busy,
    /// A verified version set ready for adoption. The caller swaps it in and
    /// keeps polling; the pass continues with the patch phase.
    Commit(VersionSet),
    Done(UpdateOutcome),
}

enum UpdateStep {
    Initialize,
    CheckPlayerUpdate {
        request: SharedRequest<GetUpdateInfoRequest>,
    },
    RedirectPrompt {
        prompt: SharedRequest<MessageRequest>,
        player_url: String,
        remote_version: String,
    },
    FetchVersionSet {
        request: SharedRequest<GetVersionSetRequest>,
        info: UpdateInfo,
    },
    DownloadManifests {
        batch: DownloadBatch,
        versions: VersionSet,
        info: UpdateInfo,
    },
    ConfirmDownload {
        prompt: SharedRequest<MessageRequest>,
        batch: DownloadBatch,
        versions: VersionSet,
        info: UpdateInfo,
    },
    Download {
        batch: DownloadBatch,
        versions: VersionSet,
        info: UpdateInfo,
    },
    RetryPrompt {
        prompt: SharedRequest<MessageRequest>,
        batch: DownloadBatch,
        versions: VersionSet,
        info: UpdateInfo,
    },
    Clearing {
        request: SharedRequest<RemoveFilesRequest>,
        versions: VersionSet,
    },
    Reload {
        request: SharedRequest<ReloadRequest>,
    },
    CheckPatch {
        request: SharedRequest<GetPatchUpdateInfoRequest>,
    },
    DownloadPatch {
        request: SharedRequest<PatchDownloadRequest>,
        info: PatchUpdateInfo,
    },
    ApplyPatch {
        archive: Vec<u8>,
        info: PatchUpdateInfo,
    },
    InvalidateCaches {
        info: PatchUpdateInfo,
    },
    NotifyFailure {
        prompt: SharedRequest<MessageRequest>,
        error: ContentError,
    },
    Finished,
}

impl UpdateStep {
    fn name(&self) -> &'static str {
        match self {
            UpdateStep::Initialize => "initialize",
            UpdateStep::CheckPlayerUpdate { .. } => "check_player_update",
            UpdateStep::RedirectPrompt { .. } => "redirect_prompt",
            UpdateStep::FetchVersionSet { .. } => "fetch_version_set",
            UpdateStep::DownloadManifests { .. } => "download_manifests",
            UpdateStep::ConfirmDownload { .. } => "confirm_download",
            UpdateStep::Download { .. } => "download",
            UpdateStep::RetryPrompt { .. } => "retry_prompt",
            UpdateStep::Clearing { .. } => "clearing",
            UpdateStep::Reload { .. } => "reload",
            UpdateStep::CheckPatch { .. } => "check_patch",
            UpdateStep::DownloadPatch { .. } => "download_patch",
            UpdateStep::ApplyPatch { .. } => "apply_patch",
            UpdateStep::InvalidateCaches { .. } => "invalidate_caches",
            UpdateStep::NotifyFailure { .. } => "notify_failure",
            UpdateStep::Finished => "finished",
        }
    }
}

enum Step {
    Continue(UpdateStep),
    Await(UpdateStep),
    Commit(VersionSet, UpdateStep),
    Terminate(UpdateOutcome),
}

fn join_url(
    base: &str,
    file: &str,
) -> String {
    format!("{}/{}", base.trim_end_matches('/'), file)
}

fn format_bytes(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    if bytes as f64 >= MB {
        format!("{:.1} MB", bytes as f64 / MB)
    } else {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    }
}

/// Drives one full update pass as a polled state machine: check the remote
/// descriptor, fetch and verify the advertised version set, download the
/// missing bundles, clear superseded files, verify everything on disk, hand
/// the set to the caller for adoption, then check for and apply a native
/// patch. Every suspension point is a scheduler request, so the pass never
/// blocks the caller's thread.
pub struct Updater {
    state: Option<UpdateStep>,
    config: PlayerConfig,
    paths: ContentPaths,
    source: Arc<dyn ContentSource>,
    bootstrap: Arc<dyn Bootstrap>,
    prompter: Arc<dyn Prompter>,
    local_timestamp: i64,
    patch_baseline: i32,
    content_updated: bool,
    patch_applied: Option<i32>,
    retries_left: u32,
}

impl Updater {
    pub fn new(
        config: PlayerConfig,
        paths: ContentPaths,
        source: Arc<dyn ContentSource>,
        bootstrap: Arc<dyn Bootstrap>,
        prompter: Arc<dyn Prompter>,
        local_timestamp: i64,
        patch_baseline: i32,
    ) -> Updater {
        let retries_left = config.max_retry_times;
        Updater {
            state: Some(UpdateStep::Initialize),
            config,
            paths,
            source,
            bootstrap,
            prompter,
            local_timestamp,
            patch_baseline,
            content_updated: false,
            patch_applied: None,
            retries_left,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.is_none()
    }

    pub fn state_name(&self) -> &'static str {
        self.state.as_ref().map(|s| s.name()).unwrap_or("done")
    }

    /// Download progress of the current step, for UI. Zero outside the
    /// download phases.
    pub fn progress(&self) -> f32 {
        match &self.state {
            Some(UpdateStep::DownloadManifests { batch, .. })
            | Some(UpdateStep::Download { batch, .. }) => batch.progress(),
            Some(UpdateStep::Reload { request }) => request.lock().unwrap().base.progress,
            _ => 0.0,
        }
    }

    fn outcome(&self) -> UpdateOutcome {
        if self.content_updated || self.patch_applied.is_some() {
            UpdateOutcome::Updated {
                patch_applied: self.patch_applied,
            }
        } else {
            UpdateOutcome::UpToDate
        }
    }

    fn content_url(
        &self,
        info: &UpdateInfo,
    ) -> String {
        if info.download_url.is_empty() {
            self.config.download_url.clone()
        } else {
            info.download_url.clone()
        }
    }

    /// Advance the state machine. Synchronous steps are chained within one
    /// call; a step waiting on a request returns `Busy` until its request
    /// settles on a later tick.
    pub fn update(
        &mut self,
        scheduler: &mut Scheduler,
    ) -> UpdaterPoll {
        loop {
            let Some(state) = self.state.take() else {
                return UpdaterPoll::Done(self.outcome());
            };

            match self.step(state, scheduler) {
                Step::Continue(next) => {
                    log::debug!("update step -> {}", next.name());
                    self.state = Some(next);
                }
                Step::Await(next) => {
                    self.state = Some(next);
                    return UpdaterPoll::Busy;
                }
                Step::Commit(versions, next) => {
                    log::debug!("update step -> {}", next.name());
                    self.state = Some(next);
                    return UpdaterPoll::Commit(versions);
                }
                Step::Terminate(outcome) => {
                    log::info!("update pass finished: {:?}", outcome);
                    return UpdaterPoll::Done(outcome);
                }
            }
        }
    }

    fn step(
        &mut self,
        state: UpdateStep,
        scheduler: &mut Scheduler,
    ) -> Step {
        match state {
            UpdateStep::Initialize => self.step_initialize(scheduler),
            UpdateStep::CheckPlayerUpdate { request } => {
                self.step_check_player_update(request, scheduler)
            }
            UpdateStep::RedirectPrompt {
                prompt,
                player_url,
                remote_version,
            } => self.step_redirect_prompt(prompt, player_url, remote_version),
            UpdateStep::FetchVersionSet { request, info } => {
                self.step_fetch_version_set(request, info, scheduler)
            }
            UpdateStep::DownloadManifests {
                batch,
                versions,
                info,
            } => self.step_download_manifests(batch, versions, info, scheduler),
            UpdateStep::ConfirmDownload {
                prompt,
                batch,
                versions,
                info,
            } => self.step_confirm_download(prompt, batch, versions, info, scheduler),
            UpdateStep::Download {
                batch,
                versions,
                info,
            } => self.step_download(batch, versions, info, scheduler),
            UpdateStep::RetryPrompt {
                prompt,
                batch,
                versions,
                info,
            } => self.step_retry_prompt(prompt, batch, versions, info, scheduler),
            UpdateStep::Clearing { request, versions } => {
                self.step_clearing(request, versions, scheduler)
            }
            UpdateStep::Reload { request } => self.step_reload(request, scheduler),
            UpdateStep::CheckPatch { request } => self.step_check_patch(request, scheduler),
            UpdateStep::DownloadPatch { request, info } => {
                self.step_download_patch(request, info, scheduler)
            }
            UpdateStep::ApplyPatch { archive, info } => {
                self.step_apply_patch(archive, info, scheduler)
            }
            UpdateStep::InvalidateCaches { info } => {
                self.step_invalidate_caches(info, scheduler)
            }
            UpdateStep::NotifyFailure { prompt, error } => {
                Self::step_notify_failure(prompt, error)
            }
            UpdateStep::Finished => Step::Terminate(self.outcome()),
        }
    }

    fn step_initialize(
        &mut self,
        scheduler: &mut Scheduler,
    ) -> Step {
        if !self.config.updatable || self.config.update_info_url.is_empty() {
            return self.start_check_patch(scheduler);
        }

        let request = request::shared(GetUpdateInfoRequest::new(
            self.source.clone(),
            self.config.update_info_url.clone(),
            self.local_timestamp,
        ));
        scheduler.enqueue(request.clone());
        Step::Await(UpdateStep::CheckPlayerUpdate { request })
    }

    fn step_check_player_update(
        &mut self,
        request: SharedRequest<GetUpdateInfoRequest>,
        scheduler: &mut Scheduler,
    ) -> Step {
        let mut guard = request.lock().unwrap();
        if !guard.base.is_done() {
            drop(guard);
            return Step::Await(UpdateStep::CheckPlayerUpdate { request });
        }

        if guard.base.failed() {
            if guard.base.error.as_deref() == Some(NOTHING_TO_UPDATE) {
                log::debug!("content is current, checking for a native patch");
            } else {
                // content update is best effort; offline players keep playing
                log::warn!(
                    "update info unavailable: {}",
                    guard.base.error.as_deref().unwrap_or("unknown")
                );
            }
            drop(guard);
            return self.start_check_patch(scheduler);
        }

        let Some(info) = guard.take_info() else {
            drop(guard);
            return self.start_check_patch(scheduler);
        };
        drop(guard);

        let remote = PlayerVersion::parse(&info.version);
        let local = PlayerVersion::parse(&self.config.version);
        if let (Some(remote), Some(local)) = (remote, local) {
            if PlayerVersion::requires_player_update(remote, local) {
                let prompt = request::shared(MessageRequest::new(
                    self.prompter.clone(),
                    "Update required",
                    format!(
                        "Version {} of the app is required to continue. Get it now?",
                        info.version
                    ),
                ));
                scheduler.enqueue(prompt.clone());
                return Step::Await(UpdateStep::RedirectPrompt {
                    prompt,
                    player_url: info.player_url,
                    remote_version: info.version,
                });
            }
        }

        self.start_fetch_version_set(info, scheduler)
    }

    fn step_redirect_prompt(
        &mut self,
        prompt: SharedRequest<MessageRequest>,
        player_url: String,
        remote_version: String,
    ) -> Step {
        let guard = prompt.lock().unwrap();
        if !guard.base.is_done() {
            drop(guard);
            return Step::Await(UpdateStep::RedirectPrompt {
                prompt,
                player_url,
                remote_version,
            });
        }

        if guard.accepted() {
            Step::Terminate(UpdateOutcome::RedirectRequired { player_url })
        } else {
            // remote content requires a player this binary cannot provide
            Step::Terminate(UpdateOutcome::Failed(ContentError::MajorVersionMismatch {
                remote: remote_version,
                local: self.config.version.clone(),
            }))
        }
    }

    fn start_fetch_version_set(
        &mut self,
        info: UpdateInfo,
        scheduler: &mut Scheduler,
    ) -> Step {
        let url = join_url(&self.content_url(&info), &info.file);
        let request = request::shared(GetVersionSetRequest::new(
            self.source.clone(),
            url,
            info.hash.clone(),
            info.size,
        ));
        scheduler.enqueue(request.clone());
        Step::Await(UpdateStep::FetchVersionSet { request, info })
    }

    fn step_fetch_version_set(
        &mut self,
        request: SharedRequest<GetVersionSetRequest>,
        info: UpdateInfo,
        scheduler: &mut Scheduler,
    ) -> Step {
        let mut guard = request.lock().unwrap();
        if !guard.base.is_done() {
            drop(guard);
            return Step::Await(UpdateStep::FetchVersionSet { request, info });
        }

        if guard.base.failed() {
            log::warn!(
                "version set unavailable: {}",
                guard.base.error.as_deref().unwrap_or("unknown")
            );
            drop(guard);
            return self.start_check_patch(scheduler);
        }

        let Some(versions) = guard.take_versions() else {
            drop(guard);
            return self.start_check_patch(scheduler);
        };
        drop(guard);

        if versions.timestamp <= self.local_timestamp {
            // descriptor and set disagree on freshness; never adopt backwards
            log::warn!("{}", ContentError::VersionConflict);
            return self.start_check_patch(scheduler);
        }

        // manifests are small; fetch them all before computing the delta
        let base_url = self.content_url(&info);
        let items: Vec<_> = versions
            .data
            .iter()
            .map(|version| {
                let file = version.file_name();
                DownloadRequest::new(
                    self.source.clone(),
                    join_url(&base_url, &file),
                    self.paths.download_dir.join(&file),
                    version.size,
                    version.hash.clone(),
                )
            })
            .collect();

        let batch = DownloadBatch::new(items);
        if batch.is_empty() {
            return self.compute_delta(versions, info, scheduler);
        }
        batch.enqueue(scheduler);
        Step::Await(UpdateStep::DownloadManifests {
            batch,
            versions,
            info,
        })
    }

    fn step_download_manifests(
        &mut self,
        batch: DownloadBatch,
        versions: VersionSet,
        info: UpdateInfo,
        scheduler: &mut Scheduler,
    ) -> Step {
        if !batch.is_done() {
            return Step::Await(UpdateStep::DownloadManifests {
                batch,
                versions,
                info,
            });
        }

        if !batch.succeeded() {
            // manifests retry silently; there is nothing to ask the user yet
            if self.retries_left > 0 {
                self.retries_left -= 1;
                batch.retry(scheduler);
                return Step::Await(UpdateStep::DownloadManifests {
                    batch,
                    versions,
                    info,
                });
            }
            let error = batch.first_error().unwrap_or_else(|| "download failed".to_string());
            return self.notify_failure(ContentError::Transient(error), scheduler);
        }

        self.compute_delta(versions, info, scheduler)
    }

    /// Load the fetched manifests and size up what is actually missing
    /// locally. Bundles shipped with the player or already verified in the
    /// download directory are excluded.
    fn compute_delta(
        &mut self,
        mut versions: VersionSet,
        info: UpdateInfo,
        scheduler: &mut Scheduler,
    ) -> Step {
        for version in &mut versions.data {
            let path = self.paths.download_dir.join(version.file_name());
            if let Err(e) = version.load_manifest(&path) {
                return self.notify_failure(e, scheduler);
            }
        }

        let base_url = self.content_url(&info);
        let mut seen = HashSet::default();
        let mut items = Vec::default();
        for version in &versions.data {
            let Some(manifest) = &version.manifest else {
                continue;
            };
            for bundle in &manifest.bundles {
                if !seen.insert(bundle.file.clone()) {
                    continue;
                }
                if self.bundle_verified_locally(&bundle.file, bundle.size, &bundle.hash) {
                    continue;
                }
                items.push(DownloadRequest::new(
                    self.source.clone(),
                    join_url(&base_url, &bundle.file),
                    self.paths.download_dir.join(&bundle.file),
                    bundle.size,
                    bundle.hash.clone(),
                ));
            }
        }

        let batch = DownloadBatch::new(items);
        if batch.is_empty() {
            return self.start_clearing(versions, scheduler);
        }

        let prompt = request::shared(MessageRequest::new(
            self.prompter.clone(),
            "Content update",
            format!("Download {} of new content?", format_bytes(batch.total_size())),
        ));
        scheduler.enqueue(prompt.clone());
        Step::Await(UpdateStep::ConfirmDownload {
            prompt,
            batch,
            versions,
            info,
        })
    }

    fn bundle_verified_locally(
        &self,
        file: &str,
        size: u64,
        hash: &str,
    ) -> bool {
        // files shipped inside the install image are trusted as-is
        if self.paths.player_dir.join(file).exists() {
            return true;
        }

        let downloaded = self.paths.download_dir.join(file);
        let Ok(metadata) = std::fs::metadata(&downloaded) else {
            return false;
        };
        if metadata.len() != size {
            return false;
        }
        match hashing::content_hash_file(&downloaded) {
            Ok(actual) => actual == hash,
            Err(_) => false,
        }
    }

    fn step_confirm_download(
        &mut self,
        prompt: SharedRequest<MessageRequest>,
        batch: DownloadBatch,
        versions: VersionSet,
        info: UpdateInfo,
        scheduler: &mut Scheduler,
    ) -> Step {
        let guard = prompt.lock().unwrap();
        if !guard.base.is_done() {
            drop(guard);
            return Step::Await(UpdateStep::ConfirmDownload {
                prompt,
                batch,
                versions,
                info,
            });
        }

        if !guard.accepted() {
            return Step::Terminate(UpdateOutcome::Aborted);
        }
        drop(guard);

        batch.enqueue(scheduler);
        Step::Await(UpdateStep::Download {
            batch,
            versions,
            info,
        })
    }

    fn step_download(
        &mut self,
        batch: DownloadBatch,
        versions: VersionSet,
        info: UpdateInfo,
        scheduler: &mut Scheduler,
    ) -> Step {
        if !batch.is_done() {
            return Step::Await(UpdateStep::Download {
                batch,
                versions,
                info,
            });
        }

        if !batch.succeeded() {
            let error = batch.first_error().unwrap_or_else(|| "download failed".to_string());
            if self.retries_left == 0 {
                return self.notify_failure(ContentError::Transient(error), scheduler);
            }

            let prompt = request::shared(MessageRequest::new(
                self.prompter.clone(),
                "Download failed",
                format!("{}. Retry?", error),
            ));
            scheduler.enqueue(prompt.clone());
            return Step::Await(UpdateStep::RetryPrompt {
                prompt,
                batch,
                versions,
                info,
            });
        }

        self.start_clearing(versions, scheduler)
    }

    fn step_retry_prompt(
        &mut self,
        prompt: SharedRequest<MessageRequest>,
        batch: DownloadBatch,
        versions: VersionSet,
        info: UpdateInfo,
        scheduler: &mut Scheduler,
    ) -> Step {
        let guard = prompt.lock().unwrap();
        if !guard.base.is_done() {
            drop(guard);
            return Step::Await(UpdateStep::RetryPrompt {
                prompt,
                batch,
                versions,
                info,
            });
        }

        if !guard.accepted() {
            return Step::Terminate(UpdateOutcome::Aborted);
        }
        drop(guard);

        self.retries_left -= 1;
        batch.retry(scheduler);
        Step::Await(UpdateStep::Download {
            batch,
            versions,
            info,
        })
    }

    /// Queue deletion of every file in the download directory that the new
    /// version set no longer references.
    fn start_clearing(
        &mut self,
        versions: VersionSet,
        scheduler: &mut Scheduler,
    ) -> Step {
        let mut keep = HashSet::default();
        keep.insert(VersionSet::FILE_NAME.to_string());
        keep.insert(PatchUpdateInfo::FILE_NAME.to_string());
        for version in &versions.data {
            keep.insert(version.file_name());
            if let Some(manifest) = &version.manifest {
                for bundle in &manifest.bundles {
                    keep.insert(bundle.file.clone());
                }
            }
        }

        let mut stale = Vec::default();
        if let Ok(entries) = std::fs::read_dir(&self.paths.download_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if !keep.contains(&name) {
                    stale.push(path);
                }
            }
        }

        let request = request::shared(RemoveFilesRequest::new(stale));
        scheduler.enqueue(request.clone());
        Step::Await(UpdateStep::Clearing { request, versions })
    }

    fn step_clearing(
        &mut self,
        request: SharedRequest<RemoveFilesRequest>,
        versions: VersionSet,
        scheduler: &mut Scheduler,
    ) -> Step {
        if !request.lock().unwrap().base.is_done() {
            return Step::Await(UpdateStep::Clearing { request, versions });
        }

        let reload = request::shared(ReloadRequest::new(
            versions,
            self.paths.download_dir.clone(),
            vec![
                self.paths.download_dir.clone(),
                self.paths.player_dir.clone(),
            ],
        ));
        scheduler.enqueue(reload.clone());
        Step::Await(UpdateStep::Reload { request: reload })
    }

    fn step_reload(
        &mut self,
        request: SharedRequest<ReloadRequest>,
        scheduler: &mut Scheduler,
    ) -> Step {
        let mut guard = request.lock().unwrap();
        if !guard.base.is_done() {
            drop(guard);
            return Step::Await(UpdateStep::Reload { request });
        }

        if guard.base.failed() {
            let error = guard
                .base
                .error
                .clone()
                .unwrap_or_else(|| "reload failed".to_string());
            drop(guard);
            return self.notify_failure(ContentError::Transient(error), scheduler);
        }

        let Some(committed) = guard.take_versions() else {
            drop(guard);
            return self.notify_failure(
                ContentError::Transient("reload produced no version set".to_string()),
                scheduler,
            );
        };
        drop(guard);

        // Adoption point. Persist first so a crash after this line finds the
        // new set on disk, then hand it to the caller.
        let path = self.paths.download_dir.join(VersionSet::FILE_NAME);
        if let Err(e) = committed.save_to_file(&path) {
            return self.notify_failure(e, scheduler);
        }

        self.local_timestamp = committed.timestamp;
        self.content_updated = true;
        log::info!("adopted content version {}", committed);

        let next = match self.start_check_patch(scheduler) {
            Step::Continue(next) | Step::Await(next) => next,
            Step::Terminate(_) | Step::Commit(..) => UpdateStep::Finished,
        };
        Step::Commit(committed, next)
    }

    /// Surface a fatal failure to the user and terminate once acknowledged.
    fn notify_failure(
        &mut self,
        error: ContentError,
        scheduler: &mut Scheduler,
    ) -> Step {
        let prompt = request::shared(MessageRequest::new(
            self.prompter.clone(),
            "Update failed",
            error.to_string(),
        ));
        scheduler.enqueue(prompt.clone());
        Step::Await(UpdateStep::NotifyFailure { prompt, error })
    }

    fn step_notify_failure(
        prompt: SharedRequest<MessageRequest>,
        error: ContentError,
    ) -> Step {
        if !prompt.lock().unwrap().base.is_done() {
            return Step::Await(UpdateStep::NotifyFailure { prompt, error });
        }

        // acknowledgment only; accept and decline mean the same thing here
        Step::Terminate(UpdateOutcome::Failed(error))
    }

    fn start_check_patch(
        &mut self,
        scheduler: &mut Scheduler,
    ) -> Step {
        if !self.config.updatable || self.config.patch_update_info_url.is_empty() {
            return Step::Continue(UpdateStep::Finished);
        }

        let request = request::shared(GetPatchUpdateInfoRequest::new(
            self.source.clone(),
            self.config.patch_update_info_url.clone(),
            self.patch_baseline,
        ));
        scheduler.enqueue(request.clone());
        Step::Await(UpdateStep::CheckPatch { request })
    }

    fn step_check_patch(
        &mut self,
        request: SharedRequest<GetPatchUpdateInfoRequest>,
        scheduler: &mut Scheduler,
    ) -> Step {
        let mut guard = request.lock().unwrap();
        if !guard.base.is_done() {
            drop(guard);
            return Step::Await(UpdateStep::CheckPatch { request });
        }

        if guard.base.failed() {
            if guard.base.error.as_deref() != Some(NOTHING_TO_UPDATE) {
                log::warn!(
                    "patch info unavailable: {}",
                    guard.base.error.as_deref().unwrap_or("unknown")
                );
            }
            return Step::Continue(UpdateStep::Finished);
        }

        let Some(info) = guard.take_info() else {
            return Step::Continue(UpdateStep::Finished);
        };
        drop(guard);

        let url = join_url(&self.config.download_url, &info.file);
        let download = request::shared(PatchDownloadRequest::new(
            self.source.clone(),
            url,
            info.hash.clone(),
            info.size,
        ));
        scheduler.enqueue(download.clone());
        Step::Await(UpdateStep::DownloadPatch {
            request: download,
            info,
        })
    }

    fn step_download_patch(
        &mut self,
        request: SharedRequest<PatchDownloadRequest>,
        info: PatchUpdateInfo,
        scheduler: &mut Scheduler,
    ) -> Step {
        let mut guard = request.lock().unwrap();
        if !guard.base.is_done() {
            drop(guard);
            return Step::Await(UpdateStep::DownloadPatch { request, info });
        }

        if guard.base.failed() {
            let error = guard
                .base
                .error
                .clone()
                .unwrap_or_else(|| "patch download failed".to_string());
            drop(guard);
            return self.notify_failure(ContentError::Transient(error), scheduler);
        }

        let Some(archive) = guard.take_archive() else {
            drop(guard);
            return self.notify_failure(
                ContentError::CorruptPatch("patch download produced no archive".to_string()),
                scheduler,
            );
        };

        Step::Continue(UpdateStep::ApplyPatch { archive, info })
    }

    fn step_apply_patch(
        &mut self,
        archive: Vec<u8>,
        info: PatchUpdateInfo,
        scheduler: &mut Scheduler,
    ) -> Step {
        let patch_dir = self
            .paths
            .patch_root
            .join(format!("patch_v{}", info.version));

        // Unpack and verify fully on disk before the host is told anything;
        // a corrupt patch must never be selected.
        if let Err(e) = apply_patch(
            &archive,
            &patch_dir,
            self.bootstrap.current_abi(),
            &self.config.native_lib_name,
        ) {
            return self.notify_failure(e, scheduler);
        }

        if let Err(message) = self
            .bootstrap
            .select_patch_directory(&patch_dir, &self.paths.player_dir)
        {
            return self.notify_failure(ContentError::Transient(message), scheduler);
        }

        Step::Continue(UpdateStep::InvalidateCaches { info })
    }

    fn step_invalidate_caches(
        &mut self,
        info: PatchUpdateInfo,
        scheduler: &mut Scheduler,
    ) -> Step {
        if let Err(e) = invalidate_derived_cache(&self.paths.derived_cache_dir) {
            return self.notify_failure(e, scheduler);
        }

        // record the applied patch as the new local baseline
        let path = self.paths.download_dir.join(PatchUpdateInfo::FILE_NAME);
        if let Err(e) = info.save_to_file(&path) {
            return self.notify_failure(e, scheduler);
        }

        self.patch_baseline = info.version;
        self.patch_applied = Some(info.version);
        log::info!("native patch {} applied", info.version);
        Step::Continue(UpdateStep::Finished)
    }
}
