//! Instance registry — authoritative in-memory state with broadcast to
//! WebSocket clients.
//!
//! The registry owns every record and is the only place status changes.
//! Each record sits behind its own mutex; one pump task per run feeds worker
//! output into it. Persistence and notifications run in spawned tasks so no
//! lifecycle operation waits on disk or network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, error, info, warn};

use super::history::LogHistory;
use super::model::{
    InstanceConfig, InstanceId, InstanceStatus, InstanceView, LogEntry, SupervisorEvent,
};
use crate::config::{ConfigDefaults, HistoryLimits, SupervisorConfig, WorkerCommand};
use crate::error::{InstanceError, PersistenceError};
use crate::logs::{Deduplicator, Signal, format_line};
use crate::notify::{LifecycleEvent, Notifier, NotifyContext};
use crate::process::{self, ArtifactWriter, ExitOutcome, OutputEvent, OutputStream, ProcessHandle, StreamKind};
use crate::store::{PersistedInstance, Snapshot, SnapshotStore};

type SharedRecord = Arc<Mutex<InstanceRecord>>;

/// Mutable state of one instance.
struct InstanceRecord {
    id: InstanceId,
    config: InstanceConfig,
    status: InstanceStatus,
    start_time: Option<chrono::DateTime<Utc>>,
    history: LogHistory,
    /// Present exactly while `status == Running`.
    process: Option<ProcessHandle>,
    dedup: Deduplicator,
    /// Incremented on every start; output tagged with an older run is stale.
    run: u64,
    /// Success already notified for the current run.
    succeeded: bool,
    /// Set by `delete`; a start that raced the delete must not revive it.
    removed: bool,
}

impl InstanceRecord {
    fn new(id: InstanceId, config: InstanceConfig, limits: HistoryLimits) -> Self {
        Self {
            id,
            config,
            status: InstanceStatus::Stopped,
            start_time: None,
            history: LogHistory::new(limits),
            process: None,
            dedup: Deduplicator::new(),
            run: 0,
            succeeded: false,
            removed: false,
        }
    }

    /// Whether output from `run` should still be applied.
    fn is_live(&self, run: u64) -> bool {
        self.run == run && self.process.is_some() && !self.removed
    }

    fn view(&self) -> InstanceView {
        InstanceView {
            id: self.id.clone(),
            config: self.config.clone(),
            start_time: self.start_time,
            status: self.status,
            log_history: self.history.entries().to_vec(),
        }
    }

    fn persisted(&self) -> PersistedInstance {
        PersistedInstance {
            config: self.config.clone(),
            start_time: self.start_time,
            status: self.status,
        }
    }
}

/// Millisecond-timestamp ids, bumped to stay strictly increasing.
#[derive(Debug, Default)]
struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    fn next(&self) -> InstanceId {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return InstanceId::new(candidate.to_string()),
                Err(current) => last = current,
            }
        }
    }

    /// Never hand out an id at or below a restored one. An id with no
    /// successor cannot seed the sequence and is skipped.
    fn observe(&self, id: &InstanceId) {
        if let Ok(n) = id.as_str().parse::<u64>()
            && n < u64::MAX
        {
            self.last.fetch_max(n, Ordering::SeqCst);
        }
    }
}

/// Manages every worker instance and fans events out to subscribers.
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, SharedRecord>>,
    ids: IdGenerator,
    artifacts: ArtifactWriter,
    command: WorkerCommand,
    defaults: ConfigDefaults,
    limits: HistoryLimits,
    store: Arc<dyn SnapshotStore>,
    notifier: Option<Arc<dyn Notifier>>,
    tx: broadcast::Sender<SupervisorEvent>,
    /// Serializes snapshot writes; each write reads state after acquiring it.
    persist_gate: Mutex<()>,
}

impl InstanceRegistry {
    pub fn new(
        config: &SupervisorConfig,
        store: Arc<dyn SnapshotStore>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(config.event_capacity);
        Arc::new(Self {
            instances: RwLock::new(HashMap::new()),
            ids: IdGenerator::default(),
            artifacts: ArtifactWriter::new(config.artifact_dir()),
            command: config.worker.clone(),
            defaults: config.defaults.clone(),
            limits: config.history,
            store,
            notifier,
            tx,
            persist_gate: Mutex::new(()),
        })
    }

    /// Subscribe to lifecycle and log events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Register a new stopped instance. Never starts a process.
    pub async fn create(self: &Arc<Self>, config: InstanceConfig) -> InstanceId {
        let id = {
            let mut instances = self.instances.write().await;
            let mut id = self.ids.next();
            while instances.contains_key(&id) {
                id = self.ids.next();
            }
            let record = InstanceRecord::new(id.clone(), config, self.limits);
            instances.insert(id.clone(), Arc::new(Mutex::new(record)));
            id
        };

        info!(instance_id = %id, "Instance created");
        let _ = self.tx.send(SupervisorEvent::InstanceCreated { id: id.clone() });
        self.schedule_persist();
        id
    }

    /// Start (or restart) an instance.
    ///
    /// Launch failures are not errors here: the instance moves to `Error`,
    /// the failure is logged into its history and `Ok(Error)` is returned.
    pub async fn start(self: &Arc<Self>, id: &InstanceId) -> Result<InstanceStatus, InstanceError> {
        let shared = self.get(id).await?;
        let mut record = shared.lock().await;

        if record.removed {
            return Err(not_found(id));
        }
        if record.process.is_some() {
            return Err(InstanceError::AlreadyRunning { id: id.to_string() });
        }

        let filled = record.config.fill_defaults(&self.defaults.resolve());
        if !filled.is_empty() {
            debug!(instance_id = %id, keys = ?filled, "Filled config defaults");
        }

        record.run += 1;
        record.dedup = Deduplicator::new();
        record.succeeded = false;
        let run = record.run;

        let launched = match self.artifacts.write(id, &record.config).await {
            Ok(path) => process::spawn(&self.command, &path).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let (handle, output) = match launched {
            Ok(launched) => launched,
            Err(reason) => {
                error!(instance_id = %id, error = %reason, "Failed to start worker");
                self.append(&mut record, LogEntry::error(format!("❌ Failed to start worker: {reason}")));
                self.set_status(&mut record, InstanceStatus::Error);
                self.notify(&shared, &record, LifecycleEvent::Errored, reason);
                drop(record);
                self.schedule_persist();
                return Ok(InstanceStatus::Error);
            }
        };

        info!(instance_id = %id, pid = ?handle.pid(), run, "Instance started");
        record.process = Some(handle);
        record.start_time = Some(Utc::now());
        self.append(&mut record, LogEntry::info("▶️ Worker started"));
        self.set_status(&mut record, InstanceStatus::Running);
        self.notify(&shared, &record, LifecycleEvent::Started, "Worker started");
        drop(record);

        tokio::spawn(Arc::clone(self).pump(shared, run, output));
        self.schedule_persist();
        Ok(InstanceStatus::Running)
    }

    /// Same as `start`.
    pub async fn restart(self: &Arc<Self>, id: &InstanceId) -> Result<InstanceStatus, InstanceError> {
        self.start(id).await
    }

    /// Terminate the worker if one is running and mark the instance stopped.
    pub async fn stop(self: &Arc<Self>, id: &InstanceId) -> Result<(), InstanceError> {
        let shared = self.get(id).await?;
        let mut record = shared.lock().await;
        if record.removed {
            return Err(not_found(id));
        }

        let was_running = match record.process.take() {
            Some(mut handle) => {
                if !handle.terminate() {
                    warn!(instance_id = %id, "Worker had already exited when stop was requested");
                }
                true
            }
            None => false,
        };

        for entry in record.dedup.flush() {
            self.append(&mut record, entry);
        }
        self.append(&mut record, LogEntry::info("⏹️ Worker stopped by user"));
        self.set_status(&mut record, InstanceStatus::Stopped);
        if was_running {
            self.notify(&shared, &record, LifecycleEvent::Stopped, "Worker stopped by user");
        }
        drop(record);

        info!(instance_id = %id, was_running, "Instance stopped");
        self.schedule_persist();
        Ok(())
    }

    /// Tell observers to clear their rendered log. Stored history is kept.
    pub async fn clear_logs(&self, id: &InstanceId) -> Result<(), InstanceError> {
        self.get(id).await?;
        debug!(instance_id = %id, "Clearing observer logs");
        let _ = self.tx.send(SupervisorEvent::LogsCleared { id: id.clone() });
        Ok(())
    }

    /// Forget an instance and remove its artifact. A running instance is
    /// refused unless `force`, which terminates the worker first.
    pub async fn delete(self: &Arc<Self>, id: &InstanceId, force: bool) -> Result<(), InstanceError> {
        {
            let mut instances = self.instances.write().await;
            let shared = instances.get(id).cloned().ok_or_else(|| not_found(id))?;
            let mut record = shared.lock().await;

            if let Some(handle) = record.process.as_mut() {
                if !force {
                    return Err(InstanceError::StillRunning { id: id.to_string() });
                }
                handle.terminate();
                record.process = None;
            }
            record.removed = true;
            instances.remove(id);
        }

        if let Err(e) = self.artifacts.remove(id).await {
            warn!(instance_id = %id, error = %e, "Failed to remove config artifact");
        }

        info!(instance_id = %id, force, "Instance deleted");
        let _ = self.tx.send(SupervisorEvent::InstanceRemoved { id: id.clone() });
        self.schedule_persist();
        Ok(())
    }

    /// Point-in-time copies of every instance, oldest first.
    pub async fn list(&self) -> Vec<InstanceView> {
        let mut views = Vec::new();
        for shared in self.records().await {
            views.push(shared.lock().await.view());
        }
        views.sort_by(|a, b| a.id.creation_order().cmp(&b.id.creation_order()));
        views
    }

    /// Point-in-time copy of one instance.
    pub async fn get_view(&self, id: &InstanceId) -> Result<InstanceView, InstanceError> {
        Ok(self.get(id).await?.lock().await.view())
    }

    // ── Persistence ─────────────────────────────────────────────────

    /// Load the stored snapshot and re-create its records. Instances that
    /// were running when the snapshot was written are started again.
    /// Returns the number of restored instances.
    pub async fn restore(self: &Arc<Self>) -> usize {
        let snapshot = match self.store.load().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!("No snapshot found, starting empty");
                return 0;
            }
            Err(e) => {
                error!(error = %e, "Failed to load snapshot, starting empty");
                return 0;
            }
        };

        let count = snapshot.len();
        let mut resume = Vec::new();
        {
            let mut instances = self.instances.write().await;
            for (id, persisted) in snapshot {
                self.ids.observe(&id);
                let mut record = InstanceRecord::new(id.clone(), persisted.config, self.limits);
                record.start_time = persisted.start_time;
                if persisted.status == InstanceStatus::Running {
                    resume.push(id.clone());
                } else {
                    record.status = persisted.status;
                }
                instances.insert(id, Arc::new(Mutex::new(record)));
            }
        }

        for id in resume {
            info!(instance_id = %id, "Resuming instance that was running before restart");
            if let Ok(shared) = self.get(&id).await {
                let mut record = shared.lock().await;
                self.append(&mut record, LogEntry::info("🔄 Resuming after supervisor restart"));
            }
            if let Err(e) = self.start(&id).await {
                warn!(instance_id = %id, error = %e, "Failed to resume instance");
            }
        }

        info!(count, "Restored instances from snapshot");
        count
    }

    /// Write a snapshot of the current state now.
    pub async fn persist_now(&self) -> Result<(), PersistenceError> {
        let _gate = self.persist_gate.lock().await;
        let snapshot = self.snapshot().await;
        self.store.save(&snapshot).await
    }

    fn schedule_persist(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.persist_now().await {
                error!(error = %e, "Failed to persist snapshot");
            }
        });
    }

    async fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for shared in self.records().await {
            let record = shared.lock().await;
            if !record.removed {
                snapshot.insert(record.id.clone(), record.persisted());
            }
        }
        snapshot
    }

    // ── Worker output ───────────────────────────────────────────────

    /// Consume one run's output in order until the process exits.
    async fn pump(self: Arc<Self>, shared: SharedRecord, run: u64, mut output: OutputStream) {
        while let Some(event) = output.next().await {
            match event {
                OutputEvent::Line { stream, line } => {
                    self.ingest_line(&shared, run, stream, &line).await;
                }
                OutputEvent::ReadError { stream, message } => {
                    let mut record = shared.lock().await;
                    if record.is_live(run) {
                        let entry = LogEntry::error(format!("⚠️ Lost worker output on {stream:?}: {message}"));
                        self.append(&mut record, entry);
                    }
                }
                OutputEvent::Exited(outcome) => {
                    self.finish_run(&shared, run, outcome).await;
                    break;
                }
            }
        }
    }

    async fn ingest_line(self: &Arc<Self>, shared: &SharedRecord, run: u64, stream: StreamKind, line: &str) {
        let Some(formatted) = format_line(line, stream.log_kind()) else {
            return;
        };

        let mut record = shared.lock().await;
        if !record.is_live(run) {
            debug!(instance_id = %record.id, run, "Dropping output from stale run");
            return;
        }

        for entry in record.dedup.observe(&formatted.message, formatted.kind) {
            self.append(&mut record, entry);
        }

        if formatted.signal == Some(Signal::Success) && !record.succeeded {
            record.succeeded = true;
            info!(instance_id = %record.id, "Worker reported success");
            self.notify(shared, &record, LifecycleEvent::Succeeded, formatted.message);
        }
    }

    async fn finish_run(self: &Arc<Self>, shared: &SharedRecord, run: u64, outcome: ExitOutcome) {
        let mut record = shared.lock().await;
        if !record.is_live(run) {
            debug!(instance_id = %record.id, run, outcome = ?outcome, "Ignoring exit of stale run");
            return;
        }
        record.process = None;

        for entry in record.dedup.flush() {
            self.append(&mut record, entry);
        }

        let status = outcome.status();
        let (entry, event) = match &outcome {
            ExitOutcome::Code(0) => (
                LogEntry::info("✅ Worker finished successfully"),
                LifecycleEvent::Completed,
            ),
            ExitOutcome::Code(code) => (
                LogEntry::error(format!("❌ Process exited with code {code}")),
                LifecycleEvent::Errored,
            ),
            ExitOutcome::Abnormal(reason) => (
                LogEntry::error(format!("❌ Process ended abnormally: {reason}")),
                LifecycleEvent::Errored,
            ),
        };

        info!(instance_id = %record.id, status = %status, outcome = ?outcome, "Instance exited");
        let message = entry.message.clone();
        self.append(&mut record, entry);
        self.set_status(&mut record, status);
        self.notify(shared, &record, event, message);
        drop(record);

        self.schedule_persist();
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn get(&self, id: &InstanceId) -> Result<SharedRecord, InstanceError> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn records(&self) -> Vec<SharedRecord> {
        self.instances.read().await.values().cloned().collect()
    }

    /// Append to history and broadcast, under the caller's record lock.
    fn append(&self, record: &mut InstanceRecord, entry: LogEntry) {
        let event = SupervisorEvent::log_appended(&record.id, &entry);
        if let Some(discarded) = record.history.push(entry) {
            debug!(instance_id = %record.id, discarded, "Compacted log history");
        }
        if !record.removed {
            let _ = self.tx.send(event);
        }
    }

    fn set_status(&self, record: &mut InstanceRecord, status: InstanceStatus) {
        record.status = status;
        if !record.removed {
            let _ = self.tx.send(SupervisorEvent::StatusChanged {
                id: record.id.clone(),
                status,
            });
        }
    }

    /// Dispatch a notification in the background. Failures are logged into
    /// the instance's history.
    fn notify(
        self: &Arc<Self>,
        shared: &SharedRecord,
        record: &InstanceRecord,
        event: LifecycleEvent,
        message: impl Into<String>,
    ) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        if !notifier.accepts(event) {
            return;
        }

        let ctx = NotifyContext::new(record.id.clone(), event, message, &record.config);
        let this = Arc::clone(self);
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            match notifier.notify(&ctx).await {
                Ok(()) => debug!(instance_id = %ctx.instance_id, event = %event, "Notification sent"),
                Err(e) => {
                    warn!(
                        instance_id = %ctx.instance_id,
                        notifier = notifier.name(),
                        error = %e,
                        "Notification failed"
                    );
                    let mut record = shared.lock().await;
                    this.append(&mut record, LogEntry::error(format!("⚠️ Notification failed: {e}")));
                }
            }
        });
    }
}

fn not_found(id: &InstanceId) -> InstanceError {
    InstanceError::NotFound { id: id.to_string() }
}
