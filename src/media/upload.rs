use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StreamError};
use crate::media::types::{EncodedUnit, TimecodeMode};

/// Terminal result of one upload session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Complete,
    Failed(String),
}

type Watcher = Box<dyn FnOnce(&UploadOutcome) + Send>;

struct GateState {
    outcome: Option<UploadOutcome>,
    acks: u32,
    watchers: Vec<Watcher>,
}

/// One-shot completion gate bridging asynchronous upload callbacks to a
/// blocking wait.
///
/// `acknowledged` may fire any number of times before resolution; the
/// first terminal call (`complete` or `fail`) wins and later terminal
/// calls are no-ops, so the session resolves exactly once. Not reusable
/// across sessions.
pub struct UploadGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl UploadGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                outcome: None,
                acks: 0,
                watchers: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    /// Intermediate per-fragment signal. Ignored after resolution.
    pub fn acknowledged(&self) {
        let mut state = self.state.lock();
        if state.outcome.is_none() {
            state.acks += 1;
        }
    }

    pub fn complete(&self) {
        self.resolve(UploadOutcome::Complete);
    }

    pub fn fail(&self, cause: impl Into<String>) {
        self.resolve(UploadOutcome::Failed(cause.into()));
    }

    fn resolve(&self, outcome: UploadOutcome) {
        let watchers = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            self.cond.notify_all();
            std::mem::take(&mut state.watchers)
        };
        // Outside the lock: watchers may grab other locks.
        for watcher in watchers {
            watcher(&outcome);
        }
    }

    /// Register a callback invoked exactly once with the terminal
    /// outcome, on the resolving thread. Runs immediately when the gate
    /// has already resolved.
    pub fn watch(&self, watcher: impl FnOnce(&UploadOutcome) + Send + 'static) {
        let mut state = self.state.lock();
        match state.outcome.clone() {
            None => state.watchers.push(Box::new(watcher)),
            Some(outcome) => {
                drop(state);
                watcher(&outcome);
            }
        }
    }

    pub fn outcome(&self) -> Option<UploadOutcome> {
        self.state.lock().outcome.clone()
    }

    pub fn acks(&self) -> u32 {
        self.state.lock().acks
    }

    /// Suspend the calling thread until the session resolves. An expired
    /// deadline is a `Timeout`, distinct from an explicit failure.
    pub fn wait(&self, deadline: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock();
        match deadline {
            None => {
                while state.outcome.is_none() {
                    self.cond.wait(&mut state);
                }
            }
            Some(limit) => {
                let until = Instant::now() + limit;
                while state.outcome.is_none() {
                    if self.cond.wait_until(&mut state, until).timed_out() {
                        return Err(StreamError::Timeout(limit.as_millis() as u64));
                    }
                }
            }
        }
        match state.outcome.as_ref() {
            Some(UploadOutcome::Complete) => Ok(()),
            Some(UploadOutcome::Failed(cause)) => Err(StreamError::UploadFailed(cause.clone())),
            None => unreachable!("gate resolved without outcome"),
        }
    }
}

/// Session-wide upload book-keeping shared by the controller, the
/// projector and gate watchers: which dispatches are still unresolved,
/// and the first failure any of them reported.
pub struct UploadTracker {
    pending: Mutex<Vec<Arc<UploadGate>>>,
    failure: Mutex<Option<String>>,
}

impl UploadTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        })
    }

    /// Remember a dispatched gate until it resolves. Gates that already
    /// completed are pruned opportunistically to keep the list short.
    pub fn track(&self, gate: Arc<UploadGate>) {
        let mut pending = self.pending.lock();
        pending.retain(|g| g.outcome().is_none());
        pending.push(gate);
    }

    /// Forget a gate whose outcome the caller has already consumed.
    pub fn settle(&self, gate: &Arc<UploadGate>) {
        self.pending.lock().retain(|g| !Arc::ptr_eq(g, gate));
    }

    /// Record a failed upload. The first recorded cause wins.
    pub fn fail(&self, cause: impl Into<String>) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(cause.into());
        }
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Reset between sessions.
    pub fn clear(&self) {
        self.pending.lock().clear();
        *self.failure.lock() = None;
    }

    /// Block until every tracked upload resolves, within one overall
    /// deadline. A recorded failure, a failed gate or an expired deadline
    /// surfaces as an error.
    pub fn wait_idle(&self, deadline: Option<Duration>) -> Result<()> {
        if let Some(cause) = self.failure() {
            return Err(StreamError::UploadFailed(cause));
        }
        let pending: Vec<_> = std::mem::take(&mut *self.pending.lock());
        let until = deadline.map(|limit| Instant::now() + limit);
        for gate in pending {
            let remaining = until.map(|t| t.saturating_duration_since(Instant::now()));
            gate.wait(remaining)?;
        }
        Ok(())
    }
}

/// What a single dispatch carries.
pub enum UploadPayload {
    Frame(EncodedUnit),
    Container(Bytes),
}

/// Capability interface to the remote ingestion endpoint. Dispatch is
/// asynchronous: the call returns at once and the gate resolves later.
pub trait UploadSink: Send + Sync {
    fn dispatch(&self, payload: UploadPayload) -> Arc<UploadGate>;
}

/// Maps unit timestamps according to the session timecode mode. The first
/// dispatched timestamp becomes the session epoch in relative mode.
struct TimecodeMapper {
    mode: TimecodeMode,
    epoch_ms: Mutex<Option<i64>>,
}

impl TimecodeMapper {
    fn new(mode: TimecodeMode) -> Self {
        Self {
            mode,
            epoch_ms: Mutex::new(None),
        }
    }

    fn map(&self, ts_ms: i64) -> i64 {
        match self.mode {
            TimecodeMode::Absolute => ts_ms,
            TimecodeMode::Relative => {
                let mut epoch = self.epoch_ms.lock();
                let base = *epoch.get_or_insert(ts_ms);
                ts_ms - base
            }
        }
    }
}

/// Live sink: one HTTP dispatch per encoded frame.
pub struct HttpFrameSink {
    client: reqwest::Client,
    endpoint: String,
    stream_name: String,
    timecode: TimecodeMapper,
    handle: tokio::runtime::Handle,
}

impl HttpFrameSink {
    /// Must be constructed inside a tokio runtime; dispatches are spawned
    /// onto it so callers on plain threads can still dispatch.
    pub fn new(endpoint: impl Into<String>, stream_name: impl Into<String>, timecode: TimecodeMode) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            stream_name: stream_name.into(),
            timecode: TimecodeMapper::new(timecode),
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl UploadSink for HttpFrameSink {
    fn dispatch(&self, payload: UploadPayload) -> Arc<UploadGate> {
        let gate = UploadGate::new();
        let unit = match payload {
            UploadPayload::Frame(unit) => unit,
            UploadPayload::Container(_) => {
                gate.fail("frame sink cannot carry a container");
                return gate;
            }
        };

        let url = format!("{}/streams/{}/frames", self.endpoint, self.stream_name);
        let request = self
            .client
            .post(url)
            .header("content-type", "application/octet-stream")
            .header("x-frame-sequence", unit.seq.to_string())
            .header("x-frame-keyframe", unit.is_keyframe.to_string())
            .header("x-frame-timecode-ms", self.timecode.map(unit.pts_ms).to_string())
            .header("x-frame-duration-ms", unit.duration_ms.to_string())
            .body(unit.data);

        let task_gate = Arc::clone(&gate);
        self.handle.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    task_gate.acknowledged();
                    task_gate.complete();
                }
                Ok(response) => {
                    task_gate.fail(format!("ingest endpoint returned {}", response.status()));
                }
                Err(e) => task_gate.fail(e.to_string()),
            }
        });
        gate
    }
}

/// Batch sink: one HTTP dispatch per finished container.
pub struct HttpContainerSink {
    client: reqwest::Client,
    endpoint: String,
    stream_name: String,
    timecode: TimecodeMapper,
    handle: tokio::runtime::Handle,
}

impl HttpContainerSink {
    pub fn new(endpoint: impl Into<String>, stream_name: impl Into<String>, timecode: TimecodeMode) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            stream_name: stream_name.into(),
            timecode: TimecodeMapper::new(timecode),
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl UploadSink for HttpContainerSink {
    fn dispatch(&self, payload: UploadPayload) -> Arc<UploadGate> {
        let gate = UploadGate::new();
        let container = match payload {
            UploadPayload::Container(buf) => buf,
            UploadPayload::Frame(_) => {
                gate.fail("container sink cannot carry a bare frame");
                return gate;
            }
        };

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let url = format!("{}/streams/{}/media", self.endpoint, self.stream_name);
        let request = self
            .client
            .post(url)
            .header("content-type", "video/x-matroska")
            .header("x-media-timecode-ms", self.timecode.map(now_ms).to_string())
            .body(container);

        let task_gate = Arc::clone(&gate);
        self.handle.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    task_gate.acknowledged();
                    task_gate.complete();
                }
                Ok(response) => {
                    task_gate.fail(format!("ingest endpoint returned {}", response.status()));
                }
                Err(e) => task_gate.fail(e.to_string()),
            }
        });
        gate
    }
}
