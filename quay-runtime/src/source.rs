use crossbeam_channel::{Receiver, Sender};
use quay_base::ContentError;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

//
// Interface for fetching content. A source hands back a FetchHandle that the
// requesting side polls from the scheduler thread; workers report progress
// through atomics and deliver the final result into the handle. Completion
// is observed by polling, never by blocking.
//

/// Where fetched bytes should land.
#[derive(Clone, Debug)]
pub enum Destination {
    Memory,
    File(PathBuf),
}

#[derive(Clone, Debug)]
pub struct FetchSpec {
    pub url: String,
    pub destination: Destination,
    /// Seeds the progress denominator before the server reports a length.
    pub expected_size: Option<u64>,
}

#[derive(Debug)]
pub enum FetchPayload {
    Bytes(Vec<u8>),
    File(PathBuf),
}

enum FetchState {
    InFlight,
    Done(Result<FetchPayload, String>),
    Taken,
}

/// Shared between the issuing request and the worker that serves it.
pub struct FetchHandle {
    state: Mutex<FetchState>,
    downloaded: AtomicU64,
    total: AtomicU64,
}

impl FetchHandle {
    fn new(expected_size: Option<u64>) -> FetchHandle {
        FetchHandle {
            state: Mutex::new(FetchState::InFlight),
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(expected_size.unwrap_or(0)),
        }
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> f32 {
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        (self.downloaded_bytes() as f32 / total as f32).min(1.0)
    }

    /// Take the result if the fetch finished. Yields the result exactly once.
    pub fn poll_result(&self) -> Option<Result<FetchPayload, String>> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            FetchState::InFlight | FetchState::Taken => None,
            FetchState::Done(_) => {
                match std::mem::replace(&mut *state, FetchState::Taken) {
                    FetchState::Done(result) => Some(result),
                    _ => unreachable!(),
                }
            }
        }
    }

    fn finish(
        &self,
        result: Result<FetchPayload, String>,
    ) {
        *self.state.lock().unwrap() = FetchState::Done(result);
    }
}

/// A data source we can fetch content from. Implementations must not block
/// the caller; the returned handle completes asynchronously.
pub trait ContentSource: Send + Sync {
    fn fetch(
        &self,
        spec: FetchSpec,
    ) -> Arc<FetchHandle>;
}

struct FetchJob {
    spec: FetchSpec,
    handle: Arc<FetchHandle>,
}

// Thread that takes jobs off the request channel and ends when the finish
// channel is signalled.
struct FetchWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl FetchWorkerThread {
    fn new(
        client: reqwest::blocking::Client,
        request_rx: Receiver<FetchJob>,
        thread_index: usize,
    ) -> FetchWorkerThread {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let thread_name = format!("Fetch Thread {}", thread_index);
        let join_handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                profiling::register_thread!(&thread_name);
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            let Ok(job) = msg else {
                                return;
                            };
                            profiling::scope!("FetchJob");
                            let result = run_http_fetch(&client, &job);
                            job.handle.finish(result);
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })
            .unwrap();

        FetchWorkerThread {
            finish_tx,
            join_handle,
        }
    }
}

fn run_http_fetch(
    client: &reqwest::blocking::Client,
    job: &FetchJob,
) -> Result<FetchPayload, String> {
    log::debug!("GET {}", job.spec.url);

    let response = client
        .get(&job.spec.url)
        .send()
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("{} for {}", response.status(), job.spec.url));
    }

    if let Some(length) = response.content_length() {
        job.handle.total.store(length, Ordering::Release);
    }

    match &job.spec.destination {
        Destination::Memory => {
            let bytes = copy_with_progress(response, std::io::sink(), &job.handle, true)?;
            Ok(FetchPayload::Bytes(bytes))
        }
        Destination::File(path) => {
            // Stream to a side file, rename only on success so a partial
            // download never masquerades as a finished one
            let part_path = path.with_extension("part");
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
            let file = std::fs::File::create(&part_path).map_err(|e| e.to_string())?;
            copy_with_progress(response, file, &job.handle, false)?;
            std::fs::rename(&part_path, path).map_err(|e| e.to_string())?;
            Ok(FetchPayload::File(path.clone()))
        }
    }
}

// Reads the response in chunks, keeping the shared progress counter fresh.
// When `collect` is set the bytes are also accumulated and returned.
fn copy_with_progress<W: Write>(
    mut response: reqwest::blocking::Response,
    mut writer: W,
    handle: &FetchHandle,
    collect: bool,
) -> Result<Vec<u8>, String> {
    let mut collected = Vec::default();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = response.read(&mut buffer).map_err(|e| e.to_string())?;
        if read == 0 {
            break;
        }

        if collect {
            collected.extend_from_slice(&buffer[..read]);
        } else {
            writer.write_all(&buffer[..read]).map_err(|e| e.to_string())?;
        }
        handle.downloaded.fetch_add(read as u64, Ordering::Release);
    }

    Ok(collected)
}

/// Trust configuration for the HTTP client; the pluggable certificate
/// handler of the wire protocol.
#[derive(Copy, Clone, Debug)]
pub enum TrustPolicy {
    System,
    AcceptInvalid,
}

/// Fetches over plain HTTP GET with a small worker pool. Workers stream
/// responses and report progress through the shared handles; the pool dies
/// with the source.
pub struct HttpSource {
    worker_threads: Vec<FetchWorkerThread>,
    request_tx: Sender<FetchJob>,
}

impl HttpSource {
    pub fn new(
        worker_count: usize,
        trust: TrustPolicy,
    ) -> Result<HttpSource, ContentError> {
        let mut builder = reqwest::blocking::Client::builder();
        if let TrustPolicy::AcceptInvalid = trust {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| ContentError::Transient(e.to_string()))?;

        let (request_tx, request_rx) = crossbeam_channel::unbounded::<FetchJob>();

        let mut worker_threads = Vec::with_capacity(worker_count);
        for thread_index in 0..worker_count {
            worker_threads.push(FetchWorkerThread::new(
                client.clone(),
                request_rx.clone(),
                thread_index,
            ));
        }

        Ok(HttpSource {
            worker_threads,
            request_tx,
        })
    }
}

impl Drop for HttpSource {
    fn drop(&mut self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in self.worker_threads.drain(..) {
            let _ = worker_thread.join_handle.join();
        }
    }
}

impl ContentSource for HttpSource {
    fn fetch(
        &self,
        spec: FetchSpec,
    ) -> Arc<FetchHandle> {
        let handle = Arc::new(FetchHandle::new(spec.expected_size));
        let job = FetchJob {
            spec,
            handle: handle.clone(),
        };
        // Worker threads outlive every handle unless the source is dropped,
        // in which case pending fetches are abandoned
        let _ = self.request_tx.send(job);
        handle
    }
}

/// Serves fetches from a local directory. URLs are resolved by stripping the
/// configured base and joining the remainder onto the root. Used by the demo
/// and by tests as a stand-in for a CDN.
pub struct DirSource {
    root: PathBuf,
    base_url: String,
}

impl DirSource {
    pub fn new(
        root: impl Into<PathBuf>,
        base_url: impl Into<String>,
    ) -> DirSource {
        DirSource {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    fn resolve(
        &self,
        url: &str,
    ) -> Result<PathBuf, String> {
        let relative = url
            .strip_prefix(&self.base_url)
            .ok_or_else(|| format!("url {} is outside source base {}", url, self.base_url))?;
        Ok(self.root.join(relative.trim_start_matches('/')))
    }
}

impl ContentSource for DirSource {
    fn fetch(
        &self,
        spec: FetchSpec,
    ) -> Arc<FetchHandle> {
        let handle = Arc::new(FetchHandle::new(spec.expected_size));

        let result = self.resolve(&spec.url).and_then(|source_path| {
            let data = std::fs::read(&source_path)
                .map_err(|e| format!("{}: {}", source_path.display(), e))?;
            handle.total.store(data.len() as u64, Ordering::Release);
            handle
                .downloaded
                .store(data.len() as u64, Ordering::Release);

            match &spec.destination {
                Destination::Memory => Ok(FetchPayload::Bytes(data)),
                Destination::File(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                    }
                    std::fs::write(path, &data).map_err(|e| e.to_string())?;
                    Ok(FetchPayload::File(path.clone()))
                }
            }
        });

        handle.finish(result);
        handle
    }
}
