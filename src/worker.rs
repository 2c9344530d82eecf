use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng as _;
use tokio_util::sync::CancellationToken;

use crate::{
    jobs::{ClaimOutcome, JobStore, JobStoreError, StageContext, WorkStatus},
    model::Project,
};

pub const MIN_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub enum StageError {
    Cancelled,
    Io(std::io::Error),
    Hook(String),
    Storage(JobStoreError),
    Other(String),
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "stage cancelled"),
            Self::Io(err) => write!(f, "stage io: {err}"),
            Self::Hook(message) => write!(f, "hook failed: {message}"),
            Self::Storage(err) => write!(f, "{err}"),
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<JobStoreError> for StageError {
    fn from(err: JobStoreError) -> Self {
        Self::Storage(err)
    }
}

/// Work performed for a project item while its claim is held.
///
/// `stage` is the status the item had when it was claimed.
#[async_trait]
pub trait ProjectStage: Send + Sync {
    async fn run(
        &self,
        stage: WorkStatus,
        project: &Project,
        ctx: &StageContext,
    ) -> Result<(), StageError>;
}

/// Next pause before polling again.
///
/// The first retry waits the floor; later retries double the previous pause and
/// add uniform jitter in `[0, last)`, clamped to `[MIN_BACKOFF, MAX_BACKOFF]`.
pub fn backoff(last: Duration, retries: u32) -> Duration {
    if retries == 0 {
        return MIN_BACKOFF;
    }
    let jitter = if last.is_zero() {
        Duration::ZERO
    } else {
        let nanos = u64::try_from(last.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::rng().random_range(0..nanos))
    };
    last.saturating_mul(2)
        .saturating_add(jitter)
        .clamp(MIN_BACKOFF, MAX_BACKOFF)
}

/// Polls the job store and drives project items through their stages.
pub struct Worker {
    store: JobStore,
    stage: Arc<dyn ProjectStage>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("store", &self.store.db_path())
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(store: JobStore, stage: Arc<dyn ProjectStage>) -> Self {
        Self { store, stage }
    }

    /// Runs until `cancel` fires. Stage failures are logged and retried with backoff.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut delay = Duration::ZERO;
        let mut retries: u32 = 0;
        tracing::info!(db = %self.store.db_path().display(), "worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.store.claim_next_project(self.stage.as_ref(), &cancel).await {
                Ok(ClaimOutcome::NoWorkAvailable) => {
                    retries = 0;
                    delay = MIN_BACKOFF;
                }
                Ok(ClaimOutcome::Advanced {
                    work_id,
                    project,
                    from,
                    to,
                }) => {
                    tracing::info!(
                        work_id,
                        project = %project.name,
                        from = %from,
                        to = %to,
                        "project advanced"
                    );
                    retries = 0;
                    delay = backoff(delay, retries);
                }
                Err(err) => {
                    retries = retries.saturating_add(1);
                    delay = backoff(delay, retries);
                    tracing::error!(retries, delay_ms = delay.as_millis() as u64, "worker: {err}");
                }
            }
        }

        tracing::info!("worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::{MAX_BACKOFF, MIN_BACKOFF, ProjectStage, StageError, Worker, backoff};
    use crate::{
        jobs::{JobStore, StageContext, WorkStatus},
        model::Project,
    };

    #[test]
    fn backoff_starts_at_floor() {
        assert_eq!(backoff(Duration::ZERO, 0), MIN_BACKOFF);
        assert_eq!(backoff(Duration::from_secs(10), 0), MIN_BACKOFF);
    }

    #[test]
    fn backoff_grows_and_stays_clamped() {
        let mut delay = MIN_BACKOFF;
        for retries in 1..20 {
            let next = backoff(delay, retries);
            assert!(next >= MIN_BACKOFF, "{next:?} below floor");
            assert!(next <= MAX_BACKOFF, "{next:?} above ceiling");
            assert!(next >= delay.saturating_mul(2).min(MAX_BACKOFF));
            delay = next;
        }
        assert_eq!(delay, MAX_BACKOFF);
    }

    #[test]
    fn backoff_from_zero_is_clamped_to_floor() {
        assert_eq!(backoff(Duration::ZERO, 3), MIN_BACKOFF);
    }

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProjectStage for Counting {
        async fn run(
            &self,
            _stage: WorkStatus,
            _project: &Project,
            _ctx: &StageContext,
        ) -> Result<(), StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_drives_project_to_done_and_stops_on_cancel() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let store =
            JobStore::open(temp.path().join("jobs.db"), Duration::from_secs(5)).expect("store");
        store
            .enqueue_project(&Project {
                name: "demo1".to_owned(),
                working_dir: temp.path().to_path_buf(),
                desc: String::new(),
            })
            .await
            .expect("enqueue");

        let stage = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let worker = Worker::new(store.clone(), stage.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });

        for _ in 0..200 {
            if stage.calls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker should stop")
            .expect("join");

        assert_eq!(stage.calls.load(Ordering::SeqCst), 2);
        let work = store.list_work().await.expect("list");
        assert_eq!(work[0].status, WorkStatus::Done);
    }
}
