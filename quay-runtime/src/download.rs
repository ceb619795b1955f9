use crate::request::{Outcome, Request, RequestBase, SharedRequest};
use crate::scheduler::Scheduler;
use crate::source::{ContentSource, Destination, FetchHandle, FetchPayload, FetchSpec};
use quay_base::hashing;
use std::path::PathBuf;
use std::sync::Arc;

/// Downloads one content-addressed file into the download directory,
/// verifying size and checksum. Files that already verify locally are
/// skipped without touching the network: content-addressed files are
/// immutable, so a verified file never needs refetching.
pub struct DownloadRequest {
    pub base: RequestBase,
    source: Arc<dyn ContentSource>,
    url: String,
    dest: PathBuf,
    expected_size: u64,
    expected_hash: String,
    fetch: Option<Arc<FetchHandle>>,
}

impl DownloadRequest {
    pub const KIND: &'static str = "download";

    pub fn new(
        source: Arc<dyn ContentSource>,
        url: String,
        dest: PathBuf,
        expected_size: u64,
        expected_hash: String,
    ) -> DownloadRequest {
        DownloadRequest {
            base: RequestBase::default(),
            source,
            url,
            dest,
            expected_size,
            expected_hash,
            fetch: None,
        }
    }

    pub fn dest(&self) -> &PathBuf {
        &self.dest
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn downloaded_bytes(&self) -> u64 {
        match &self.fetch {
            Some(fetch) => fetch.downloaded_bytes(),
            // a verified skip counts as fully downloaded
            None if self.base.succeeded() => self.expected_size,
            None => 0,
        }
    }

    /// True when the file on disk already matches what the manifest expects.
    fn verify_local(&self) -> bool {
        let Ok(metadata) = std::fs::metadata(&self.dest) else {
            return false;
        };
        if self.expected_size != 0 && metadata.len() != self.expected_size {
            return false;
        }
        if self.expected_hash.is_empty() {
            return true;
        }

        match hashing::content_hash_file(&self.dest) {
            Ok(hash) => hash == self.expected_hash,
            Err(_) => false,
        }
    }
}

impl Request for DownloadRequest {
    fn kind(&self) -> &'static str {
        DownloadRequest::KIND
    }

    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }

    fn on_start(&mut self) {
        if self.verify_local() {
            log::debug!("download skip, already verified: {}", self.dest.display());
            self.base.set_result(Outcome::Success, None);
            return;
        }

        self.fetch = Some(self.source.fetch(FetchSpec {
            url: self.url.clone(),
            destination: Destination::File(self.dest.clone()),
            expected_size: Some(self.expected_size),
        }));
    }

    fn on_update(&mut self) {
        let Some(fetch) = &self.fetch else {
            return;
        };
        self.base.progress = fetch.progress();

        let Some(result) = fetch.poll_result() else {
            return;
        };

        match result {
            Ok(FetchPayload::File(_)) | Ok(FetchPayload::Bytes(_)) => {
                if self.verify_local() {
                    self.base.set_result(Outcome::Success, None);
                } else {
                    // corrupt download; drop it so a retry starts clean
                    let _ = std::fs::remove_file(&self.dest);
                    self.base.set_result(
                        Outcome::Failed,
                        Some(format!("checksum mismatch for {}", self.url)),
                    );
                }
            }
            Err(error) => {
                self.base.set_result(Outcome::Failed, Some(error));
            }
        }
    }

    fn on_completed(&mut self) {
        log::debug!("download {} {:?}", self.url, self.base.outcome);
    }

    fn on_retry(&mut self) {
        self.fetch = None;
    }
}

/// Fans a set of file downloads through the scheduler, which bounds how many
/// run at once, and aggregates their progress. Not itself a request: the
/// orchestrator polls it as a suspension point and can re-arm only the
/// failed children.
pub struct DownloadBatch {
    items: Vec<SharedRequest<DownloadRequest>>,
    total_size: u64,
}

impl DownloadBatch {
    pub fn new(items: Vec<DownloadRequest>) -> DownloadBatch {
        let total_size = items.iter().map(|i| i.expected_size).sum();
        DownloadBatch {
            items: items.into_iter().map(crate::request::shared).collect(),
            total_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn enqueue(
        &self,
        scheduler: &mut Scheduler,
    ) {
        for item in &self.items {
            scheduler.enqueue(item.clone());
        }
    }

    pub fn is_done(&self) -> bool {
        self.items
            .iter()
            .all(|i| i.lock().unwrap().base.is_done())
    }

    pub fn succeeded(&self) -> bool {
        self.items
            .iter()
            .all(|i| i.lock().unwrap().base.succeeded())
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.items
            .iter()
            .map(|i| i.lock().unwrap().downloaded_bytes())
            .sum()
    }

    pub fn progress(&self) -> f32 {
        if self.total_size == 0 {
            return 1.0;
        }
        (self.downloaded_bytes() as f32 / self.total_size as f32).min(1.0)
    }

    pub fn first_error(&self) -> Option<String> {
        self.items
            .iter()
            .find_map(|i| i.lock().unwrap().base.error.clone())
    }

    /// Re-arm every failed child and admit it again. Finished children are
    /// untouched, so partial progress survives a retry.
    pub fn retry(
        &self,
        scheduler: &mut Scheduler,
    ) {
        for item in &self.items {
            if item.lock().unwrap().base.failed() {
                scheduler.retry(item);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::DirSource;
    use std::time::Duration;

    fn write_remote(
        dir: &std::path::Path,
        name: &str,
        data: &[u8],
    ) -> (u64, String) {
        std::fs::write(dir.join(name), data).unwrap();
        (data.len() as u64, hashing::content_hash(data))
    }

    #[test]
    fn download_verifies_and_skips_existing() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let (size, hash) = write_remote(remote.path(), "a.bundle", b"bundle-a");

        let source: Arc<dyn ContentSource> =
            Arc::new(DirSource::new(remote.path(), "http://cdn.test"));
        let mut scheduler = Scheduler::new(Duration::from_secs(1), 0);

        let request = crate::request::shared(DownloadRequest::new(
            source.clone(),
            "http://cdn.test/a.bundle".to_string(),
            local.path().join("a.bundle"),
            size,
            hash.clone(),
        ));
        scheduler.enqueue(request.clone());
        scheduler.tick();
        scheduler.tick();

        assert!(request.lock().unwrap().base.succeeded());
        assert_eq!(
            std::fs::read(local.path().join("a.bundle")).unwrap(),
            b"bundle-a"
        );

        // second download of the same content-addressed file is a pure skip
        let again = crate::request::shared(DownloadRequest::new(
            source,
            "http://cdn.test/a.bundle".to_string(),
            local.path().join("a.bundle"),
            size,
            hash,
        ));
        scheduler.enqueue(again.clone());
        scheduler.tick();
        assert!(again.lock().unwrap().base.succeeded());
        assert_eq!(again.lock().unwrap().downloaded_bytes(), size);
    }

    #[test]
    fn checksum_mismatch_fails_and_removes_the_file() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write_remote(remote.path(), "a.bundle", b"tampered");

        let source: Arc<dyn ContentSource> =
            Arc::new(DirSource::new(remote.path(), "http://cdn.test"));
        let mut scheduler = Scheduler::new(Duration::from_secs(1), 0);

        let request = crate::request::shared(DownloadRequest::new(
            source,
            "http://cdn.test/a.bundle".to_string(),
            local.path().join("a.bundle"),
            8,
            "not-the-right-hash".to_string(),
        ));
        scheduler.enqueue(request.clone());
        scheduler.tick();
        scheduler.tick();

        assert!(request.lock().unwrap().base.failed());
        assert!(!local.path().join("a.bundle").exists());
    }

    #[test]
    fn batch_retry_rearms_only_failed_children() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let (size_a, hash_a) = write_remote(remote.path(), "a.bundle", b"aaaa");
        // b is missing from the remote at first

        let source: Arc<dyn ContentSource> =
            Arc::new(DirSource::new(remote.path(), "http://cdn.test"));
        let mut scheduler = Scheduler::new(Duration::from_secs(1), 0);

        let batch = DownloadBatch::new(vec![
            DownloadRequest::new(
                source.clone(),
                "http://cdn.test/a.bundle".to_string(),
                local.path().join("a.bundle"),
                size_a,
                hash_a,
            ),
            DownloadRequest::new(
                source.clone(),
                "http://cdn.test/b.bundle".to_string(),
                local.path().join("b.bundle"),
                4,
                hashing::content_hash(b"bbbb"),
            ),
        ]);
        batch.enqueue(&mut scheduler);
        for _ in 0..4 {
            scheduler.tick();
        }

        assert!(batch.is_done());
        assert!(!batch.succeeded());
        assert!(batch.first_error().is_some());

        // the missing file appears; retry touches only the failed child
        write_remote(remote.path(), "b.bundle", b"bbbb");
        batch.retry(&mut scheduler);
        for _ in 0..4 {
            scheduler.tick();
        }

        assert!(batch.succeeded());
        assert_eq!(batch.downloaded_bytes(), batch.total_size());
    }
}
