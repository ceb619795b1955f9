use crate::request::{Outcome, Request, RequestBase};
use crate::source::{ContentSource, Destination, FetchHandle, FetchPayload, FetchSpec};
use quay_base::{hashing, PatchUpdateInfo, UpdateInfo, VersionSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Error text used when the remote update info is no fresher than what we
/// already have. Callers treat this failure as benign.
pub const NOTHING_TO_UPDATE: &str = "nothing to update";

fn fetch_memory(
    source: &Arc<dyn ContentSource>,
    url: &str,
    expected_size: Option<u64>,
) -> Arc<FetchHandle> {
    source.fetch(FetchSpec {
        url: url.to_string(),
        destination: Destination::Memory,
        expected_size,
    })
}

fn poll_bytes(
    base: &mut RequestBase,
    fetch: &Option<Arc<FetchHandle>>,
) -> Option<Vec<u8>> {
    let fetch = fetch.as_ref()?;
    base.progress = fetch.progress();

    match fetch.poll_result()? {
        Ok(FetchPayload::Bytes(bytes)) => Some(bytes),
        Ok(FetchPayload::File(path)) => {
            // memory fetches never land on disk
            base.set_result(
                Outcome::Failed,
                Some(format!("unexpected file payload at {}", path.display())),
            );
            None
        }
        Err(error) => {
            base.set_result(Outcome::Failed, Some(error));
            None
        }
    }
}

/// Fetches the remote update descriptor and compares its freshness against
/// the locally adopted timestamp. Reports failure with [`NOTHING_TO_UPDATE`]
/// when the remote offers nothing newer.
pub struct GetUpdateInfoRequest {
    pub base: RequestBase,
    source: Arc<dyn ContentSource>,
    url: String,
    local_timestamp: i64,
    fetch: Option<Arc<FetchHandle>>,
    info: Option<UpdateInfo>,
}

impl GetUpdateInfoRequest {
    pub fn new(
        source: Arc<dyn ContentSource>,
        url: String,
        local_timestamp: i64,
    ) -> GetUpdateInfoRequest {
        GetUpdateInfoRequest {
            base: RequestBase::default(),
            source,
            url,
            local_timestamp,
            fetch: None,
            info: None,
        }
    }

    pub fn info(&self) -> Option<&UpdateInfo> {
        self.info.as_ref()
    }

    pub fn take_info(&mut self) -> Option<UpdateInfo> {
        self.info.take()
    }
}

impl Request for GetUpdateInfoRequest {
    fn kind(&self) -> &'static str {
        "update_info"
    }

    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }

    fn on_start(&mut self) {
        self.fetch = Some(fetch_memory(&self.source, &self.url, None));
    }

    fn on_update(&mut self) {
        let Some(bytes) = poll_bytes(&mut self.base, &self.fetch) else {
            return;
        };

        let info: UpdateInfo = match serde_json::from_slice(&bytes) {
            Ok(info) => info,
            Err(e) => {
                self.base.set_result(Outcome::Failed, Some(e.to_string()));
                return;
            }
        };

        if info.timestamp <= self.local_timestamp {
            self.base
                .set_result(Outcome::Failed, Some(NOTHING_TO_UPDATE.to_string()));
            return;
        }

        self.info = Some(info);
        self.base.set_result(Outcome::Success, None);
    }

    fn on_retry(&mut self) {
        self.fetch = None;
        self.info = None;
    }
}

/// Fetches the version set named by an update descriptor, verifying its
/// checksum before parsing. The parsed set is not adopted here; the
/// orchestrator commits it only after downloads and reload verification.
pub struct GetVersionSetRequest {
    pub base: RequestBase,
    source: Arc<dyn ContentSource>,
    url: String,
    expected_hash: String,
    expected_size: u64,
    fetch: Option<Arc<FetchHandle>>,
    versions: Option<VersionSet>,
}

impl GetVersionSetRequest {
    pub fn new(
        source: Arc<dyn ContentSource>,
        url: String,
        expected_hash: String,
        expected_size: u64,
    ) -> GetVersionSetRequest {
        GetVersionSetRequest {
            base: RequestBase::default(),
            source,
            url,
            expected_hash,
            expected_size,
            fetch: None,
            versions: None,
        }
    }

    pub fn take_versions(&mut self) -> Option<VersionSet> {
        self.versions.take()
    }
}

impl Request for GetVersionSetRequest {
    fn kind(&self) -> &'static str {
        "version_set"
    }

    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }

    fn on_start(&mut self) {
        self.fetch = Some(fetch_memory(
            &self.source,
            &self.url,
            Some(self.expected_size),
        ));
    }

    fn on_update(&mut self) {
        let Some(bytes) = poll_bytes(&mut self.base, &self.fetch) else {
            return;
        };

        if !self.expected_hash.is_empty() {
            let hash = hashing::content_hash(&bytes);
            if hash != self.expected_hash {
                self.base.set_result(
                    Outcome::Failed,
                    Some(format!("version set checksum mismatch for {}", self.url)),
                );
                return;
            }
        }

        match serde_json::from_slice::<VersionSet>(&bytes) {
            Ok(versions) => {
                self.versions = Some(versions);
                self.base.set_result(Outcome::Success, None);
            }
            Err(e) => {
                self.base.set_result(Outcome::Failed, Some(e.to_string()));
            }
        }
    }

    fn on_retry(&mut self) {
        self.fetch = None;
        self.versions = None;
    }
}

/// Fetches the remote native-patch descriptor. A remote patch level at or
/// below the local baseline fails with [`NOTHING_TO_UPDATE`].
pub struct GetPatchUpdateInfoRequest {
    pub base: RequestBase,
    source: Arc<dyn ContentSource>,
    url: String,
    local_patch_version: i32,
    fetch: Option<Arc<FetchHandle>>,
    info: Option<PatchUpdateInfo>,
}

impl GetPatchUpdateInfoRequest {
    pub fn new(
        source: Arc<dyn ContentSource>,
        url: String,
        local_patch_version: i32,
    ) -> GetPatchUpdateInfoRequest {
        GetPatchUpdateInfoRequest {
            base: RequestBase::default(),
            source,
            url,
            local_patch_version,
            fetch: None,
            info: None,
        }
    }

    pub fn take_info(&mut self) -> Option<PatchUpdateInfo> {
        self.info.take()
    }
}

impl Request for GetPatchUpdateInfoRequest {
    fn kind(&self) -> &'static str {
        "patch_update_info"
    }

    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }

    fn on_start(&mut self) {
        self.fetch = Some(fetch_memory(&self.source, &self.url, None));
    }

    fn on_update(&mut self) {
        let Some(bytes) = poll_bytes(&mut self.base, &self.fetch) else {
            return;
        };

        let info: PatchUpdateInfo = match serde_json::from_slice(&bytes) {
            Ok(info) => info,
            Err(e) => {
                self.base.set_result(Outcome::Failed, Some(e.to_string()));
                return;
            }
        };

        if info.version <= self.local_patch_version {
            self.base
                .set_result(Outcome::Failed, Some(NOTHING_TO_UPDATE.to_string()));
            return;
        }

        self.info = Some(info);
        self.base.set_result(Outcome::Success, None);
    }

    fn on_retry(&mut self) {
        self.fetch = None;
        self.info = None;
    }
}

/// Downloads a patch archive into memory and verifies its checksum. Patches
/// are small relative to content, so they are not streamed to disk.
pub struct PatchDownloadRequest {
    pub base: RequestBase,
    source: Arc<dyn ContentSource>,
    url: String,
    expected_hash: String,
    expected_size: u64,
    fetch: Option<Arc<FetchHandle>>,
    archive: Option<Vec<u8>>,
}

impl PatchDownloadRequest {
    pub fn new(
        source: Arc<dyn ContentSource>,
        url: String,
        expected_hash: String,
        expected_size: u64,
    ) -> PatchDownloadRequest {
        PatchDownloadRequest {
            base: RequestBase::default(),
            source,
            url,
            expected_hash,
            expected_size,
            fetch: None,
            archive: None,
        }
    }

    pub fn take_archive(&mut self) -> Option<Vec<u8>> {
        self.archive.take()
    }
}

impl Request for PatchDownloadRequest {
    fn kind(&self) -> &'static str {
        "patch_download"
    }

    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }

    fn on_start(&mut self) {
        self.fetch = Some(fetch_memory(
            &self.source,
            &self.url,
            Some(self.expected_size),
        ));
    }

    fn on_update(&mut self) {
        let Some(bytes) = poll_bytes(&mut self.base, &self.fetch) else {
            return;
        };

        if !self.expected_hash.is_empty() && hashing::content_hash(&bytes) != self.expected_hash {
            self.base.set_result(
                Outcome::Failed,
                Some(format!("patch checksum mismatch for {}", self.url)),
            );
            return;
        }

        self.archive = Some(bytes);
        self.base.set_result(Outcome::Success, None);
    }

    fn on_retry(&mut self) {
        self.fetch = None;
        self.archive = None;
    }
}

/// Deletes a list of files, one per tick to stay inside the frame budget.
/// Deletion is best effort; a file that cannot be removed is logged and
/// skipped, and the request still succeeds.
pub struct RemoveFilesRequest {
    pub base: RequestBase,
    files: Vec<PathBuf>,
    position: usize,
}

impl RemoveFilesRequest {
    pub fn new(files: Vec<PathBuf>) -> RemoveFilesRequest {
        RemoveFilesRequest {
            base: RequestBase::default(),
            files,
            position: 0,
        }
    }
}

impl Request for RemoveFilesRequest {
    fn kind(&self) -> &'static str {
        "remove_files"
    }

    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }

    fn on_start(&mut self) {}

    fn on_update(&mut self) {
        if self.position >= self.files.len() {
            self.base.set_result(Outcome::Success, None);
            return;
        }

        let file = &self.files[self.position];
        if let Err(e) = std::fs::remove_file(file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("could not remove {}: {}", file.display(), e);
            }
        } else {
            log::debug!("removed superseded file {}", file.display());
        }

        self.position += 1;
        self.base.progress = self.position as f32 / self.files.len() as f32;
        if self.position >= self.files.len() {
            self.base.set_result(Outcome::Success, None);
        }
    }
}

/// Verifies that every bundle named by a pending version set is present on
/// disk, one version per tick, loading each manifest as it goes. Success
/// hands back a set ready to be committed; any missing manifest or bundle
/// fails the request and the pending set is discarded.
pub struct ReloadRequest {
    pub base: RequestBase,
    versions: Option<VersionSet>,
    search_roots: Vec<PathBuf>,
    manifest_dir: PathBuf,
    position: usize,
}

impl ReloadRequest {
    pub fn new(
        versions: VersionSet,
        manifest_dir: PathBuf,
        search_roots: Vec<PathBuf>,
    ) -> ReloadRequest {
        ReloadRequest {
            base: RequestBase::default(),
            versions: Some(versions),
            search_roots,
            manifest_dir,
            position: 0,
        }
    }

    pub fn take_versions(&mut self) -> Option<VersionSet> {
        self.versions.take()
    }
}

impl Request for ReloadRequest {
    fn kind(&self) -> &'static str {
        "reload"
    }

    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }

    fn on_start(&mut self) {}

    fn on_update(&mut self) {
        let Some(versions) = self.versions.as_mut() else {
            self.base
                .set_result(Outcome::Failed, Some("no pending version set".to_string()));
            return;
        };
        let total = versions.data.len();

        if self.position >= total {
            self.base.set_result(Outcome::Success, None);
            return;
        }

        let version = &mut versions.data[self.position];
        let manifest_path = self.manifest_dir.join(version.file_name());

        let mut failure = None;
        if let Err(e) = version.load_manifest(&manifest_path) {
            failure = Some(format!("manifest {} unusable: {}", manifest_path.display(), e));
        } else if let Some(manifest) = version.manifest.as_ref() {
            for bundle in &manifest.bundles {
                let present = self
                    .search_roots
                    .iter()
                    .any(|root| root.join(&bundle.file).exists());
                if !present {
                    failure = Some(format!("bundle {} missing", bundle.file));
                    break;
                }
            }
        }

        if let Some(message) = failure {
            self.versions = None;
            self.base.set_result(Outcome::Failed, Some(message));
            return;
        }

        self.position += 1;
        self.base.progress = self.position as f32 / total as f32;
        if self.position >= total {
            self.base.set_result(Outcome::Success, None);
        }
    }
}

/// Shared slot a prompter resolves once the user answers.
#[derive(Clone, Default)]
pub struct DecisionHandle {
    decision: Arc<Mutex<Option<bool>>>,
}

impl DecisionHandle {
    pub fn resolve(
        &self,
        accepted: bool,
    ) {
        *self.decision.lock().unwrap() = Some(accepted);
    }

    pub fn get(&self) -> Option<bool> {
        *self.decision.lock().unwrap()
    }
}

/// Presents a question to the player and eventually resolves the handle.
/// Implementations hand the message to whatever UI the host has; the default
/// answers yes immediately for headless use.
pub trait Prompter: Send + Sync {
    fn prompt(
        &self,
        title: &str,
        message: &str,
        decision: DecisionHandle,
    );
}

#[derive(Default)]
pub struct AutoConfirm;

impl Prompter for AutoConfirm {
    fn prompt(
        &self,
        _title: &str,
        _message: &str,
        decision: DecisionHandle,
    ) {
        decision.resolve(true);
    }
}

/// A user-facing question modelled as a request so the orchestrator can
/// suspend on it like any other asynchronous step. Succeeds on accept,
/// fails on decline.
pub struct MessageRequest {
    pub base: RequestBase,
    prompter: Arc<dyn Prompter>,
    title: String,
    message: String,
    decision: DecisionHandle,
}

impl MessageRequest {
    pub fn new(
        prompter: Arc<dyn Prompter>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> MessageRequest {
        MessageRequest {
            base: RequestBase::default(),
            prompter,
            title: title.into(),
            message: message.into(),
            decision: DecisionHandle::default(),
        }
    }

    pub fn accepted(&self) -> bool {
        self.base.succeeded()
    }
}

impl Request for MessageRequest {
    fn kind(&self) -> &'static str {
        "message"
    }

    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }

    fn on_start(&mut self) {
        self.prompter
            .prompt(&self.title, &self.message, self.decision.clone());
    }

    fn on_update(&mut self) {
        match self.decision.get() {
            Some(true) => self.base.set_result(Outcome::Success, None),
            Some(false) => self
                .base
                .set_result(Outcome::Failed, Some("declined".to_string())),
            None => {}
        }
    }
}
