//! Serial writer pool, parallel reader pool, and periodic jobs. Grounded
//! in `event_handler.py`'s `_upload_threadpool`/`_download_threadpool`/
//! `_threadpool` and the polling loop in `EventHandler.run`. The single
//! worker restriction on the writer pool is the same one the source
//! documents implicitly by giving `UPLOAD_WORKERS` a default of 1: the
//! remote provider does not tolerate concurrent mutation of the same
//! subtree.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::reconciler::{Dispatch, ReaderJob, Reconciler, WriterJob};

pub const DEFAULT_UPLOAD_WORKERS: usize = 1;
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 32;
pub const DEFAULT_ICLOUD_CHECK_PERIOD: Duration = Duration::from_secs(20);
pub const DEFAULT_ICLOUD_REFRESH_PERIOD: Duration = Duration::from_secs(90);
/// Per §4.6: a failed background refresh backs off by doubling, capped at
/// 6x the configured period, rather than retrying at the nominal cadence.
pub const REFRESH_BACKOFF_CAP_MULTIPLIER: u32 = 6;

pub struct SchedulerConfig {
    pub max_readers: usize,
    pub icloud_check_period: Duration,
    pub icloud_refresh_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_readers: DEFAULT_DOWNLOAD_WORKERS,
            icloud_check_period: DEFAULT_ICLOUD_CHECK_PERIOD,
            icloud_refresh_period: DEFAULT_ICLOUD_REFRESH_PERIOD,
        }
    }
}

/// Owns the reconciler and drives it: the serial writer queue, the
/// bounded reader pool, and the periodic dirty-check/refresh-tick jobs.
/// Exactly one `Scheduler` runs per daemon instance.
pub struct Scheduler {
    pub reconciler: Arc<Mutex<Reconciler>>,
    writer_tx: mpsc::UnboundedSender<WriterJob>,
    reader_sem: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(reconciler: Reconciler, config: SchedulerConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<WriterJob>) {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            reconciler: Arc::new(Mutex::new(reconciler)),
            writer_tx,
            reader_sem: Arc::new(Semaphore::new(config.max_readers.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            config,
        });
        (scheduler, writer_rx)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Submits `dispatch` output to the right pool; `Done` results (inline
    /// rename/move) are applied to the reconciler's post-completion hook
    /// immediately since there's no pool round-trip for them.
    pub async fn submit(self: &Arc<Self>, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Writer(job) => self.submit_writer(job),
            Dispatch::Reader(job) => self.spawn_reader(job),
            Dispatch::Done(result) => {
                let reconciler = self.reconciler.lock().await;
                reconciler.on_writer_job_completed(&result);
            }
        }
    }

    pub fn submit_writer(self: &Arc<Self>, job: WriterJob) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _ = self.writer_tx.send(job);
    }

    /// Drains the writer channel one job at a time, forever. Intended to
    /// run as its own task; the channel's single consumer is what makes
    /// this "exactly one worker" rather than a semaphore-bounded pool.
    pub async fn run_writer_pool(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<WriterJob>) {
        while let Some(job) = rx.recv().await {
            self.run_writer_job(job).await;
        }
    }

    async fn run_writer_job(self: &Arc<Self>, job: WriterJob) {
        let remote = self.reconciler.lock().await.remote.clone();
        let result = match job {
            WriterJob::Upload { path, retries } => remote.upload(path, retries).await,
            WriterJob::Delete { path, is_folder, retries } => remote.delete(path, is_folder, retries).await,
            WriterJob::Mkdir { path, retries } => remote.mkdir(path, retries).await,
        };
        self.finish_writer_result(result).await;
    }

    fn finish_writer_result<'a>(
        self: &'a Arc<Self>,
        result: crate::action_result::ActionResult,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let should_retry = result.should_retry();
            {
                let reconciler = self.reconciler.lock().await;
                reconciler.on_writer_job_completed(&result);
            }
            if should_retry {
                if let Some((_, retry)) = result.into_retry() {
                    let next_result = retry().await;
                    self.finish_writer_result(next_result).await;
                    return;
                }
            }
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        })
    }

    /// Spawns a bounded reader task; downloads write the file then record
    /// it in the local tree, folder rescans just run and record.
    pub fn spawn_reader(self: &Arc<Self>, job: ReaderJob) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let scheduler = self.clone();
        let sem = self.reader_sem.clone();
        tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            scheduler.run_reader_job(job).await;
        });
    }

    async fn run_reader_job(self: &Arc<Self>, job: ReaderJob) {
        let remote = self.reconciler.lock().await.remote.clone();
        let result = match &job {
            ReaderJob::Download { path, retries } => remote.download(path.clone(), *retries).await,
            ReaderJob::ProcessFolder { side, path, recursive } => {
                remote.process_folder(*side, path, *recursive).await
            }
        };
        if result.success {
            if let ReaderJob::Download { path, .. } = &job {
                let reconciler = self.reconciler.lock().await;
                reconciler.local.add(path);
            }
        } else if result.should_retry() {
            if let Some((_, retry)) = result.into_retry() {
                let next_result = retry().await;
                if next_result.success {
                    if let ReaderJob::Download { path, .. } = &job {
                        let reconciler = self.reconciler.lock().await;
                        reconciler.local.add(path);
                    }
                }
            }
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// True while no writer job and no reader task are outstanding; the
    /// reconciler main loop gates suppressed-path clearing and refresh
    /// application on this.
    pub fn is_idle(&self) -> bool {
        self.in_flight_count() == 0
    }

    pub fn dirty_check_period(&self) -> Duration {
        self.config.icloud_check_period
    }

    pub fn refresh_period(&self) -> Duration {
        self.config.icloud_refresh_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.max_readers, 32);
        assert_eq!(cfg.icloud_check_period, Duration::from_secs(20));
        assert_eq!(cfg.icloud_refresh_period, Duration::from_secs(90));
    }

    #[test]
    fn refresh_backoff_cap_is_six_times_the_base_period() {
        let base = Duration::from_secs(90);
        let capped = base * REFRESH_BACKOFF_CAP_MULTIPLIER;
        assert_eq!(capped, Duration::from_secs(540));
    }
}
