use crate::request::{self, AnyRequest, Callback, Request, SharedRequest};
use crossbeam_channel::{Receiver, Sender};
use quay_base::hashing::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Wall-clock budget for one scheduler tick. Once exhausted, admission and
/// progress loops exit immediately and resume next tick.
pub struct TickBudget {
    started: Instant,
    slice: Option<Duration>,
}

impl TickBudget {
    pub fn begin(slice: Option<Duration>) -> TickBudget {
        TickBudget {
            started: Instant::now(),
            slice,
        }
    }

    /// A budget with no slicing, for callers that must run to completion.
    pub fn unbounded() -> TickBudget {
        TickBudget::begin(None)
    }

    pub fn exhausted(&self) -> bool {
        match self.slice {
            Some(slice) => self.started.elapsed() > slice,
            None => false,
        }
    }
}

/// Per-kind admission queue: a waiting FIFO plus an in-flight set bounded by
/// `max_requests` (0 = unbounded).
pub struct RequestQueue {
    pub key: &'static str,
    pub priority: i32,
    pub max_requests: usize,
    waiting: VecDeque<AnyRequest>,
    processing: Vec<AnyRequest>,
}

impl RequestQueue {
    fn new(
        key: &'static str,
        priority: i32,
        max_requests: usize,
    ) -> RequestQueue {
        RequestQueue {
            key,
            priority,
            max_requests,
            waiting: VecDeque::default(),
            processing: Vec::default(),
        }
    }

    pub fn working(&self) -> bool {
        !self.waiting.is_empty() || !self.processing.is_empty()
    }

    fn enqueue(
        &mut self,
        request: AnyRequest,
    ) {
        self.waiting.push_back(request);
    }

    /// One pass: admit waiting requests up to the in-flight bound, then poll
    /// every in-flight request, completing the done ones. Returns false the
    /// moment the budget runs out so the scheduler can stop for this tick.
    fn update(
        &mut self,
        budget: &TickBudget,
    ) -> bool {
        while !self.waiting.is_empty()
            && (self.processing.len() < self.max_requests || self.max_requests == 0)
        {
            let item = self.waiting.pop_front().unwrap();
            request::start(&item);
            self.processing.push(item);
            if budget.exhausted() {
                return false;
            }
        }

        let mut index = 0;
        while index < self.processing.len() {
            if request::poll(&self.processing[index]) {
                let item = self.processing.remove(index);
                request::complete(&item);
            } else {
                index += 1;
            }

            if budget.exhausted() {
                return false;
            }
        }

        true
    }
}

/// Cooperative driver ticking all queues once per host frame under a strict
/// time budget. Queues are processed in ascending priority order; within a
/// queue admission is FIFO. There is no multi-threading here: all request
/// progress is advanced on the scheduler's thread, and concurrency comes
/// from overlapping I/O operations in flight at once.
pub struct Scheduler {
    queues: Vec<RequestQueue>,
    lookup: HashMap<&'static str, usize>,
    kind_limits: HashMap<&'static str, usize>,
    needs_sort: bool,

    pub auto_slicing: bool,
    pub slice: Duration,
    pub max_requests: usize,

    deferred_tx: Sender<Callback>,
    deferred_rx: Receiver<Callback>,
}

impl Scheduler {
    pub fn new(
        slice: Duration,
        max_requests: usize,
    ) -> Scheduler {
        let (deferred_tx, deferred_rx) = crossbeam_channel::unbounded();
        Scheduler {
            queues: Vec::default(),
            lookup: HashMap::default(),
            kind_limits: HashMap::default(),
            needs_sort: false,
            auto_slicing: true,
            slice,
            max_requests,
            deferred_tx,
            deferred_rx,
        }
    }

    /// Override the in-flight bound for one request kind. Takes effect for
    /// the existing queue and for a queue created later. 0 means unbounded.
    pub fn set_kind_limit(
        &mut self,
        kind: &'static str,
        max_requests: usize,
    ) {
        self.kind_limits.insert(kind, max_requests);
        if let Some(&index) = self.lookup.get(kind) {
            self.queues[index].max_requests = max_requests;
        }
    }

    /// Admit a request into the queue for its kind, creating the queue on
    /// first use with the request's priority.
    pub fn enqueue<R: Request + 'static>(
        &mut self,
        request: SharedRequest<R>,
    ) {
        let (key, priority) = {
            let guard = request.lock().unwrap();
            (guard.kind(), guard.priority())
        };

        let index = match self.lookup.get(key) {
            Some(&index) => index,
            None => {
                let max_requests = self
                    .kind_limits
                    .get(key)
                    .copied()
                    .unwrap_or(self.max_requests);
                let index = self.queues.len();
                self.queues
                    .push(RequestQueue::new(key, priority, max_requests));
                self.lookup.insert(key, index);
                self.needs_sort = true;
                index
            }
        };

        log::debug!("enqueue {}", key);
        let request: AnyRequest = request;
        self.queues[index].enqueue(request);
    }

    /// Defer a closure to the start of the next tick. Used for completion
    /// callbacks of already-done cache hits so callers always observe
    /// asynchronous completion.
    pub fn call_async(
        &self,
        callback: Callback,
    ) {
        // The channel is unbounded, send cannot fail while we hold both ends
        let _ = self.deferred_tx.send(callback);
    }

    pub fn working(&self) -> bool {
        self.queues.iter().any(|q| q.working())
    }

    /// Begin a budget stamped at the current instant, honoring the
    /// configured slice.
    pub fn begin_budget(&self) -> TickBudget {
        TickBudget::begin(if self.auto_slicing {
            Some(self.slice)
        } else {
            None
        })
    }

    /// One tick: run deferred closures, then update every queue in priority
    /// order, stopping early once the time budget is exhausted.
    #[profiling::function]
    pub fn tick(&mut self) {
        while let Ok(callback) = self.deferred_rx.try_recv() {
            callback();
        }

        if self.needs_sort {
            self.queues.sort_by_key(|q| q.priority);
            self.lookup.clear();
            for (index, queue) in self.queues.iter().enumerate() {
                self.lookup.insert(queue.key, index);
            }
            self.needs_sort = false;
        }

        let budget = self.begin_budget();
        for queue in &mut self.queues {
            if !queue.update(&budget) {
                break;
            }
        }
    }

    /// Re-arm a failed request and admit it again, preserving its identity.
    pub fn retry<R: Request + 'static>(
        &mut self,
        request: &SharedRequest<R>,
    ) {
        {
            let mut guard = request.lock().unwrap();
            if !guard.base().failed() {
                return;
            }
            guard.base_mut().rearm();
            guard.on_retry();
        }

        self.enqueue(request.clone());
    }

    /// Synchronously drain one request to completion. The suspension points
    /// of the async path collapse into a spin here; intended for startup and
    /// tests, not the frame loop.
    pub fn wait_for_completion(
        &mut self,
        request: &AnyRequest,
    ) {
        request::start(request);
        loop {
            if request::poll(request) {
                request::complete(request);
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::{Outcome, RequestBase};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct TickingRequest {
        base: RequestBase,
        ticks_left: u32,
        started: Arc<AtomicU32>,
        finished: Arc<AtomicU32>,
        kind: &'static str,
        priority: i32,
    }

    impl TickingRequest {
        fn new(
            ticks_left: u32,
            started: &Arc<AtomicU32>,
            finished: &Arc<AtomicU32>,
        ) -> TickingRequest {
            TickingRequest {
                base: RequestBase::default(),
                ticks_left,
                started: started.clone(),
                finished: finished.clone(),
                kind: "ticking",
                priority: 0,
            }
        }
    }

    impl Request for TickingRequest {
        fn kind(&self) -> &'static str {
            self.kind
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn base(&self) -> &RequestBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut RequestBase {
            &mut self.base
        }

        fn on_start(&mut self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_update(&mut self) {
            if self.ticks_left == 0 {
                self.base.set_result(Outcome::Success, None);
                self.finished.fetch_add(1, Ordering::SeqCst);
            } else {
                self.ticks_left -= 1;
            }
        }
    }

    #[test]
    fn fifo_admission_bounded_by_max_requests() {
        let started = Arc::new(AtomicU32::new(0));
        let finished = Arc::new(AtomicU32::new(0));

        let mut scheduler = Scheduler::new(Duration::from_secs(1), 2);
        for _ in 0..5 {
            scheduler.enqueue(crate::request::shared(TickingRequest::new(
                100, &started, &finished,
            )));
        }

        scheduler.tick();
        // in-flight bound is 2, the other three stay waiting
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn kind_limit_overrides_the_global_bound() {
        let started = Arc::new(AtomicU32::new(0));
        let finished = Arc::new(AtomicU32::new(0));

        // globally unbounded, but this kind is capped at 2
        let mut scheduler = Scheduler::new(Duration::from_secs(1), 0);
        scheduler.set_kind_limit("ticking", 2);
        for _ in 0..5 {
            scheduler.enqueue(crate::request::shared(TickingRequest::new(
                100, &started, &finished,
            )));
        }

        scheduler.tick();
        assert_eq!(started.load(Ordering::SeqCst), 2);

        // raising the limit on the live queue admits more next tick
        scheduler.set_kind_limit("ticking", 4);
        scheduler.tick();
        assert_eq!(started.load(Ordering::SeqCst), 4);

        // other kinds keep the global bound
        let other_started = Arc::new(AtomicU32::new(0));
        let other_finished = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let mut request = TickingRequest::new(100, &other_started, &other_finished);
            request.kind = "other";
            scheduler.enqueue(crate::request::shared(request));
        }
        scheduler.tick();
        assert_eq!(other_started.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unbounded_queue_admits_everything() {
        let started = Arc::new(AtomicU32::new(0));
        let finished = Arc::new(AtomicU32::new(0));

        let mut scheduler = Scheduler::new(Duration::from_secs(1), 0);
        for _ in 0..5 {
            scheduler.enqueue(crate::request::shared(TickingRequest::new(
                0, &started, &finished,
            )));
        }

        scheduler.tick();
        assert_eq!(started.load(Ordering::SeqCst), 5);
        assert_eq!(finished.load(Ordering::SeqCst), 5);
        assert!(!scheduler.working());
    }

    #[test]
    fn zero_slice_defers_work_to_later_ticks() {
        let started = Arc::new(AtomicU32::new(0));
        let finished = Arc::new(AtomicU32::new(0));

        let mut scheduler = Scheduler::new(Duration::from_secs(0), 0);
        for _ in 0..4 {
            scheduler.enqueue(crate::request::shared(TickingRequest::new(
                0, &started, &finished,
            )));
        }

        // With a zero slice the budget is exhausted after the first admitted
        // item, so each tick makes only a sliver of progress instead of
        // draining the queue.
        scheduler.tick();
        assert!(started.load(Ordering::SeqCst) < 4);
        assert!(scheduler.working());

        // Work is deferred, never rejected: enough ticks finish everything.
        for _ in 0..20 {
            scheduler.tick();
        }
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        assert!(!scheduler.working());
    }

    #[test]
    fn queues_run_in_ascending_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        struct OrderedRequest {
            base: RequestBase,
            kind: &'static str,
            priority: i32,
            order: Arc<Mutex<Vec<&'static str>>>,
        }

        impl Request for OrderedRequest {
            fn kind(&self) -> &'static str {
                self.kind
            }

            fn priority(&self) -> i32 {
                self.priority
            }

            fn base(&self) -> &RequestBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut RequestBase {
                &mut self.base
            }

            fn on_start(&mut self) {
                self.order.lock().unwrap().push(self.kind);
                self.base.set_result(Outcome::Success, None);
            }

            fn on_update(&mut self) {}
        }

        use std::sync::Mutex;

        let mut scheduler = Scheduler::new(Duration::from_secs(1), 0);
        scheduler.enqueue(crate::request::shared(OrderedRequest {
            base: RequestBase::default(),
            kind: "late",
            priority: 5,
            order: order.clone(),
        }));
        scheduler.enqueue(crate::request::shared(OrderedRequest {
            base: RequestBase::default(),
            kind: "early",
            priority: 1,
            order: order.clone(),
        }));

        scheduler.tick();
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn call_async_runs_next_tick() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new(Duration::from_secs(1), 0);

        let fired_in = fired.clone();
        scheduler.call_async(Box::new(move || {
            fired_in.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        scheduler.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_preserves_request_identity() {
        struct FailOnceRequest {
            base: RequestBase,
            attempts: u32,
        }

        impl Request for FailOnceRequest {
            fn kind(&self) -> &'static str {
                "fail_once"
            }

            fn base(&self) -> &RequestBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut RequestBase {
                &mut self.base
            }

            fn on_start(&mut self) {
                self.attempts += 1;
                if self.attempts == 1 {
                    self.base
                        .set_result(Outcome::Failed, Some("transient".to_string()));
                } else {
                    self.base.set_result(Outcome::Success, None);
                }
            }

            fn on_update(&mut self) {}
        }

        let mut scheduler = Scheduler::new(Duration::from_secs(1), 0);
        let request = crate::request::shared(FailOnceRequest {
            base: RequestBase::default(),
            attempts: 0,
        });

        scheduler.enqueue(request.clone());
        scheduler.tick();
        assert!(request.lock().unwrap().base.failed());

        scheduler.retry(&request);
        scheduler.tick();
        assert!(request.lock().unwrap().base.succeeded());
        assert_eq!(request.lock().unwrap().attempts, 2);
    }
}
