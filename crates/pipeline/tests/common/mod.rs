#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::Receiver;
use voxweave_core::plan::{SegmentPlan, TaskPlan, VoiceMapping};
use voxweave_core::progress::session_id_for_task;
use voxweave_core::scheduling::TaskStatus;
use voxweave_core::types::DbId;
use voxweave_db::models::task::SynthesisTask;
use voxweave_db::MemoryJobStore;
use voxweave_engine::{
    ArtifactMerger, EngineError, MergeError, SynthesisEngineClient, SynthesisOutput,
    SynthesisRequest,
};
use voxweave_events::{ChannelTransport, Frame, ProgressBroadcaster};
use voxweave_pipeline::{SchedulerConfig, TaskScheduler};

/// Event types that end a task's stream.
pub const TERMINAL: &[&str] = &["task_completed", "task_failed"];

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

/// Engine fake whose behaviour is keyed by segment text.
#[derive(Default)]
pub struct ScriptedEngine {
    rejected: HashSet<String>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    always_down: bool,
    /// The next N calls fail with a network error.
    outage_calls: AtomicUsize,
    calls: Mutex<Vec<SynthesisRequest>>,
}

impl ScriptedEngine {
    pub fn healthy() -> Self {
        Self::default()
    }

    /// Every call fails with a network error.
    pub fn down() -> Self {
        Self {
            always_down: true,
            ..Self::default()
        }
    }

    pub fn reject(mut self, text: &str) -> Self {
        self.rejected.insert(text.to_string());
        self
    }

    pub fn delay(mut self, text: &str, ms: u64) -> Self {
        self.delays.insert(text.to_string(), Duration::from_millis(ms));
        self
    }

    pub fn with_default_delay(mut self, ms: u64) -> Self {
        self.default_delay = Duration::from_millis(ms);
        self
    }

    pub fn with_outage(self, calls: usize) -> Self {
        self.outage_calls.store(calls, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<SynthesisRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, text: &str) -> usize {
        self.calls().iter().filter(|r| r.text == text).count()
    }
}

pub fn artifact_for(text: &str) -> String {
    format!("{}.wav", text.replace(' ', "_"))
}

#[async_trait]
impl SynthesisEngineClient for ScriptedEngine {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisOutput, EngineError> {
        self.calls.lock().unwrap().push(request.clone());

        let delay = self
            .delays
            .get(&request.text)
            .copied()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.always_down
            || self
                .outage_calls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(EngineError::Network("connection refused".into()));
        }
        if self.rejected.contains(&request.text) {
            return Err(EngineError::Rejected(format!(
                "cannot synthesize {:?}",
                request.text
            )));
        }
        Ok(SynthesisOutput {
            artifact_ref: artifact_for(&request.text),
            duration_secs: 1.5,
        })
    }
}

// ---------------------------------------------------------------------------
// Recording merger
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingMerger {
    fail: bool,
    delay: Duration,
    received: Mutex<Vec<Vec<String>>>,
}

impl RecordingMerger {
    /// Record the call, then hold it for `ms` before answering.
    pub fn slow(ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(ms),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.received.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Vec<String>> {
        self.calls().last().cloned()
    }
}

#[async_trait]
impl ArtifactMerger for RecordingMerger {
    async fn merge(&self, ordered: &[String]) -> Result<String, MergeError> {
        self.received.lock().unwrap().push(ordered.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(MergeError::Rejected {
                status: 500,
                body: "disk full".into(),
            });
        }
        Ok(format!("merged[{}]", ordered.join(",")))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        retry_backoff: Duration::from_millis(10),
        backoff_multiplier: 1.0,
        max_backoff: Duration::from_millis(100),
        engine_timeout: Duration::from_secs(2),
        window_pause: Duration::from_millis(1),
    }
}

/// Plan of `n` narrator segments "line 0" .. "line n-1", all voiced by voice 1.
pub fn plan(n: usize) -> TaskPlan {
    TaskPlan::new(
        (0..n as i32)
            .map(|i| SegmentPlan {
                order_index: i,
                text: format!("line {i}"),
                speaker: None,
            })
            .collect(),
    )
    .with_voices(VoiceMapping {
        characters: Vec::new(),
        default_voice_id: Some(1),
    })
}

pub struct Harness {
    pub scheduler: Arc<TaskScheduler>,
    pub engine: Arc<ScriptedEngine>,
    pub merger: Arc<RecordingMerger>,
    pub broadcaster: Arc<ProgressBroadcaster>,
}

pub fn harness(engine: ScriptedEngine) -> Harness {
    harness_with(engine, RecordingMerger::default(), fast_config())
}

pub fn harness_with(
    engine: ScriptedEngine,
    merger: RecordingMerger,
    config: SchedulerConfig,
) -> Harness {
    let engine = Arc::new(engine);
    let merger = Arc::new(merger);
    let broadcaster = Arc::new(ProgressBroadcaster::default());
    let scheduler = TaskScheduler::new(
        Arc::new(MemoryJobStore::new()),
        engine.clone(),
        merger.clone(),
        Arc::clone(&broadcaster),
        config,
    );
    Harness {
        scheduler,
        engine,
        merger,
        broadcaster,
    }
}

impl Harness {
    /// Subscribe a channel-backed observer to the task's session.
    pub async fn watch(&self, task_id: DbId) -> Receiver<Frame> {
        let (transport, rx) = ChannelTransport::new();
        let conn = self
            .broadcaster
            .connect(Arc::new(transport), "test")
            .await
            .unwrap();
        self.broadcaster
            .subscribe(&conn.id, &session_id_for_task(task_id))
            .await
            .unwrap();
        rx
    }

    /// Poll the store until the task reaches `status`.
    pub async fn wait_for(&self, task_id: DbId, status: TaskStatus) -> SynthesisTask {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = self.scheduler.get_task(task_id).await.unwrap();
            if task.status == status {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} stuck in {} waiting for {status}",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_terminal(&self, task_id: DbId) -> SynthesisTask {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = self.scheduler.get_task(task_id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} never finished, still {}",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Collect progress events until one of `stop` arrives (inclusive).
pub async fn events_until(rx: &mut Receiver<Frame>, stop: &[&str]) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for progress events")
            .expect("observer channel closed");
        let Frame::Text(text) = frame else {
            continue;
        };
        let message: Value = serde_json::from_str(&text).unwrap();
        if message["type"] != "progress_update" {
            continue;
        }
        let event = message["data"].clone();
        let done = stop.iter().any(|kind| event["type"] == *kind);
        events.push(event);
        if done {
            return events;
        }
    }
}

pub fn of_type<'a>(events: &'a [Value], kind: &str) -> Vec<&'a Value> {
    events.iter().filter(|e| e["type"] == kind).collect()
}
