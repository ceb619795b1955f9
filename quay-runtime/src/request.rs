use std::sync::{Arc, Mutex};

/// Lifecycle of a request. Transitions are driven by the scheduler's tick or
/// by I/O completion observed during a tick, never preemptively.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Wait,
    Processing,
    Done,
}

/// Result of a request. `Unknown` until the request reaches `Done`, fixed
/// afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Unknown,
    Success,
    Failed,
}

pub type Callback = Box<dyn FnOnce() + Send>;

/// State shared by every request type: status, outcome, progress, error
/// message and completion callbacks. Concrete requests embed one of these
/// and expose it through the `Request` trait.
pub struct RequestBase {
    pub status: Status,
    pub outcome: Outcome,
    pub progress: f32,
    pub error: Option<String>,
    completed: bool,
    callbacks: Vec<Callback>,
}

impl Default for RequestBase {
    fn default() -> Self {
        RequestBase {
            status: Status::Wait,
            outcome: Outcome::Unknown,
            progress: 0.0,
            error: None,
            completed: false,
            callbacks: Vec::default(),
        }
    }
}

impl RequestBase {
    /// Restore default field values. Used by request pools before reuse so
    /// stale state never leaks into a recycled request.
    pub fn reset(&mut self) {
        *self = RequestBase::default();
    }

    /// Transition to `Done`. Once done the result is fixed, so a second call
    /// is a no-op.
    pub fn set_result(
        &mut self,
        outcome: Outcome,
        error: Option<String>,
    ) {
        if self.status == Status::Done {
            return;
        }

        debug_assert_ne!(outcome, Outcome::Unknown);
        self.outcome = outcome;
        self.error = error;
        self.progress = 1.0;
        self.status = Status::Done;
    }

    pub fn is_done(&self) -> bool {
        self.status == Status::Done
    }

    pub fn succeeded(&self) -> bool {
        self.status == Status::Done && self.outcome == Outcome::Success
    }

    pub fn failed(&self) -> bool {
        self.status == Status::Done && self.outcome == Outcome::Failed
    }

    pub fn add_callback(
        &mut self,
        callback: Callback,
    ) {
        self.callbacks.push(callback);
    }

    /// Re-arm a failed request while preserving its identity. The caller is
    /// expected to enqueue it again.
    pub fn rearm(&mut self) {
        self.status = Status::Wait;
        self.outcome = Outcome::Unknown;
        self.error = None;
        self.completed = false;
    }

    // Returns true exactly once per completion.
    fn mark_completed(&mut self) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        true
    }

    fn take_callbacks(&mut self) -> Vec<Callback> {
        std::mem::take(&mut self.callbacks)
    }
}

/// An abstract unit of asynchronous work. `on_start` kicks off the concrete
/// I/O, `on_update` is called once per tick while processing and observes
/// the I/O by polling, never blocking. Failure is data (`set_result` with a
/// message), not a raised fault.
pub trait Request: Send {
    /// Queue key. One request queue exists per kind.
    fn kind(&self) -> &'static str;

    /// Queues are processed in ascending priority order each tick.
    fn priority(&self) -> i32 {
        0
    }

    fn base(&self) -> &RequestBase;
    fn base_mut(&mut self) -> &mut RequestBase;

    fn on_start(&mut self);
    fn on_update(&mut self);

    fn on_completed(&mut self) {}

    /// Hook for `retry`: clear whatever per-attempt state `on_start` needs
    /// fresh, keeping progress accounting.
    fn on_retry(&mut self) {}
}

pub type SharedRequest<R> = Arc<Mutex<R>>;
pub type AnyRequest = Arc<Mutex<dyn Request>>;

pub fn shared<R: Request>(request: R) -> SharedRequest<R> {
    Arc::new(Mutex::new(request))
}

/// Wait -> Processing, then the concrete start hook. `on_start` may already
/// finish the request (e.g. precondition failures), which is fine.
pub fn start(request: &AnyRequest) {
    let mut guard = request.lock().unwrap();
    if guard.base().status == Status::Wait {
        guard.base_mut().status = Status::Processing;
        guard.on_start();
    }
}

/// Advance one in-flight request. Returns true once it is done.
pub fn poll(request: &AnyRequest) -> bool {
    let mut guard = request.lock().unwrap();
    if guard.base().status == Status::Processing {
        guard.on_update();
    }
    guard.base().is_done()
}

/// Fire the completion hook and any attached callbacks exactly once.
/// Callbacks run after the request lock is released because they may
/// re-enter the cache or enqueue further work.
pub fn complete(request: &AnyRequest) {
    let callbacks = {
        let mut guard = request.lock().unwrap();
        if !guard.base_mut().mark_completed() {
            return;
        }
        guard.on_completed();
        guard.base_mut().take_callbacks()
    };

    for callback in callbacks {
        callback();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRequest {
        base: RequestBase,
        updates_until_done: u32,
        completions: Arc<AtomicU32>,
    }

    impl Request for CountingRequest {
        fn kind(&self) -> &'static str {
            "counting"
        }

        fn base(&self) -> &RequestBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut RequestBase {
            &mut self.base
        }

        fn on_start(&mut self) {}

        fn on_update(&mut self) {
            if self.updates_until_done == 0 {
                self.base.set_result(Outcome::Success, None);
            } else {
                self.updates_until_done -= 1;
            }
        }

        fn on_completed(&mut self) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn result_is_fixed_once_done() {
        let mut base = RequestBase::default();
        base.set_result(Outcome::Failed, Some("boom".to_string()));
        base.set_result(Outcome::Success, None);

        assert_eq!(base.outcome, Outcome::Failed);
        assert_eq!(base.error.as_deref(), Some("boom"));
    }

    #[test]
    fn complete_fires_exactly_once() {
        let completions = Arc::new(AtomicU32::new(0));
        let request: AnyRequest = shared(CountingRequest {
            base: RequestBase::default(),
            updates_until_done: 0,
            completions: completions.clone(),
        });

        start(&request);
        assert!(poll(&request));

        complete(&request);
        complete(&request);
        complete(&request);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_fire_on_completion() {
        let fired = Arc::new(AtomicU32::new(0));
        let request: AnyRequest = shared(CountingRequest {
            base: RequestBase::default(),
            updates_until_done: 1,
            completions: Arc::new(AtomicU32::new(0)),
        });

        {
            let fired = fired.clone();
            request
                .lock()
                .unwrap()
                .base_mut()
                .add_callback(Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }));
        }

        start(&request);
        assert!(!poll(&request));
        assert!(poll(&request));
        complete(&request);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
