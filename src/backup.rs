use crate::cache::FieldCache;
use crate::codec::SnapshotCodec;
use crate::tables::RecordId;
use crate::{error, info, warn, AppError};
use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// How long the worker sleeps between passes over the dirty set.
    pub scheduling_interval: Duration,
    /// Minimum delay between two backups of the same record, however often
    /// it is re-dirtied.
    pub interval: Duration,
    /// Upper bound on records handled per pass.
    pub batch_size: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            scheduling_interval: Duration::from_millis(500),
            interval: Duration::from_secs(2),
            batch_size: 16,
        }
    }
}

struct Lifecycle {
    state: Mutex<WorkerState>,
    cv: Condvar,
}

struct WorkerHandle {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Background worker mirroring dirty records to the snapshot store. Never
/// blocks writers: it reads snapshots under short cache locks and touches
/// the dirty set only through its separate lock.
pub struct MetadataBackup {
    cache: Arc<FieldCache>,
    codec: Arc<dyn SnapshotCodec>,
    config: BackupConfig,
    lifecycle: Arc<Lifecycle>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl MetadataBackup {
    pub fn new(cache: Arc<FieldCache>, codec: Arc<dyn SnapshotCodec>, config: BackupConfig) -> Self {
        MetadataBackup {
            cache,
            codec,
            config,
            lifecycle: Arc::new(Lifecycle { state: Mutex::new(WorkerState::Idle), cv: Condvar::new() }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> Result<WorkerState, AppError> {
        Ok(*self.lifecycle.state.lock()?)
    }

    pub fn is_running(&self) -> Result<bool, AppError> {
        Ok(matches!(self.state()?, WorkerState::Running | WorkerState::Stopping))
    }

    /// Spawn the worker. Only legal from Idle or Stopped.
    pub fn start(&self) -> Result<(), AppError> {
        {
            let mut state = self.lifecycle.state.lock()?;
            match *state {
                WorkerState::Idle | WorkerState::Stopped => *state = WorkerState::Running,
                _ => return Err(AppError::BadRequest("backup worker is already running".to_string())),
            }
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let cache = self.cache.clone();
        let codec = self.codec.clone();
        let config = self.config.clone();
        let lifecycle = self.lifecycle.clone();
        let handle = thread::spawn(move || run_loop(cache, codec, config, lifecycle, stop_rx));
        *self.worker.lock()? = Some(WorkerHandle { stop: stop_tx, handle });
        Ok(())
    }

    /// Signal the worker to exit after its current batch. Cooperative: takes
    /// effect at the next sleep/batch boundary.
    pub fn stop(&self) -> Result<(), AppError> {
        {
            let mut state = self.lifecycle.state.lock()?;
            if *state == WorkerState::Running {
                *state = WorkerState::Stopping;
            }
        }
        if let Some(worker) = self.worker.lock()?.as_ref() {
            // the worker may already have exited; a full or closed channel is fine
            let _ = worker.stop.try_send(());
        }
        Ok(())
    }

    /// Synchronous pass over the whole dirty set on the caller's thread,
    /// regardless of worker state. Returns how many records were backed up;
    /// per-record failures are logged and skipped, as in the worker loop.
    pub fn flush_now(&self) -> Result<usize, AppError> {
        let batch = self.cache.pop_backup_batch(usize::MAX, Duration::ZERO)?;
        let mut done = 0;
        for (record, stamp) in batch {
            match backup_one(&self.cache, self.codec.as_ref(), record, stamp) {
                Ok(()) => done += 1,
                Err(err) => error!("metadata backup for record {} failed: {}", record, err),
            }
        }
        Ok(done)
    }

    /// Wait up to `timeout` for the worker to reach Stopped. Repeatable;
    /// returns whether the worker is down.
    pub fn join(&self, timeout: Duration) -> Result<bool, AppError> {
        let state = self.lifecycle.state.lock()?;
        let (state, _) = self.lifecycle.cv.wait_timeout_while(state, timeout, |state| {
            matches!(*state, WorkerState::Running | WorkerState::Stopping)
        })?;
        let down = matches!(*state, WorkerState::Stopped | WorkerState::Idle);
        drop(state);
        if down {
            if let Some(worker) = self.worker.lock()?.take() {
                worker.handle.join().map_err(|_| {
                    AppError::Custom("backup worker thread panicked".to_string())
                })?;
            }
        }
        Ok(down)
    }
}

fn run_loop(
    cache: Arc<FieldCache>,
    codec: Arc<dyn SnapshotCodec>,
    config: BackupConfig,
    lifecycle: Arc<Lifecycle>,
    stop_rx: Receiver<()>,
) {
    info!("metadata backup worker started");
    loop {
        match stop_rx.recv_timeout(config.scheduling_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if let Ok(state) = lifecycle.state.lock() {
            if *state != WorkerState::Running {
                break;
            }
        }
        let batch = match cache.pop_backup_batch(config.batch_size, config.interval) {
            Ok(batch) => batch,
            Err(err) => {
                error!("metadata backup could not read the dirty set: {}", err);
                break;
            }
        };
        for (record, stamp) in batch {
            if let Err(err) = backup_one(&cache, codec.as_ref(), record, stamp) {
                // the record stays dirty and is retried on a later cycle
                error!("metadata backup for record {} failed: {}", record, err);
            }
        }
    }
    if let Ok(mut state) = lifecycle.state.lock() {
        *state = WorkerState::Stopped;
    }
    lifecycle.cv.notify_all();
    info!("metadata backup worker stopped");
}

fn backup_one(
    cache: &FieldCache,
    codec: &dyn SnapshotCodec,
    record: RecordId,
    stamp: DateTime<Utc>,
) -> Result<(), AppError> {
    let snapshot = cache.record_snapshot(record)?;
    let bytes = codec.encode(&snapshot)?;
    if !cache.store_backup(record, &bytes, stamp)? {
        warn!("record {} was re-dirtied during backup; keeping it queued", record);
    }
    Ok(())
}
