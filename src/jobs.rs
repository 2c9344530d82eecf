use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rusqlite::{Connection, OpenFlags, OptionalExtension as _, params};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::{
    model::{History, Project},
    worker::ProjectStage,
};

const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Project,
    History,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::History => "history",
        }
    }

    fn parse(raw: &str) -> Result<Self, JobStoreError> {
        match raw {
            "project" => Ok(Self::Project),
            "history" => Ok(Self::History),
            other => Err(JobStoreError::Storage(format!("unknown work domain `{other}`"))),
        }
    }
}

/// Project items move `pending -> postprocessing -> done`; history items `pending -> done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Pending,
    Postprocessing,
    Done,
}

impl WorkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Postprocessing => "postprocessing",
            Self::Done => "done",
        }
    }

    fn parse(raw: &str) -> Result<Self, JobStoreError> {
        match raw {
            "pending" => Ok(Self::Pending),
            "postprocessing" => Ok(Self::Postprocessing),
            "done" => Ok(Self::Done),
            other => Err(JobStoreError::Storage(format!("unknown work status `{other}`"))),
        }
    }

    fn next_project_stage(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Postprocessing),
            Self::Postprocessing => Some(Self::Done),
            Self::Done => None,
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    pub id: i64,
    pub domain: Domain,
    pub project: String,
    pub item_key: String,
    pub status: WorkStatus,
    pub error: Option<String>,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStoreError {
    Conflict(String),
    Storage(String),
    Payload(String),
    /// The stage handler failed; the claim was rolled back.
    Stage { work_id: i64, message: String },
}

impl fmt::Display for JobStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(message) | Self::Storage(message) => write!(f, "{message}"),
            Self::Payload(message) => write!(f, "invalid work payload: {message}"),
            Self::Stage { work_id, message } => {
                write!(f, "stage failed for work item {work_id}: {message}")
            }
        }
    }
}

impl std::error::Error for JobStoreError {}

fn storage_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> JobStoreError {
    move |err| JobStoreError::Storage(format!("{context}: {err}"))
}

fn join_err(task: &'static str) -> impl FnOnce(tokio::task::JoinError) -> JobStoreError {
    move |err| JobStoreError::Storage(format!("join {task} task: {err}"))
}

/// Result of one project-domain claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    NoWorkAvailable,
    Advanced {
        work_id: i64,
        project: Project,
        from: WorkStatus,
        to: WorkStatus,
    },
}

/// Durable work queue backed by SQLite.
#[derive(Debug, Clone)]
pub struct JobStore {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl JobStore {
    pub fn open(db_path: PathBuf, busy_timeout: Duration) -> Result<Self, JobStoreError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                JobStoreError::Storage(format!("create job store dir {}: {err}", parent.display()))
            })?;
        }

        let store = Self {
            db_path,
            busy_timeout,
        };
        let mut conn = open_connection(&store.db_path, store.busy_timeout)?;
        migrate(&mut conn)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Inserts a pending project item unless an unfinished one already exists.
    pub async fn enqueue_project(&self, project: &Project) -> Result<bool, JobStoreError> {
        let data = encode(project)?;
        let name = project.name.clone();
        self.blocking("enqueue_project", move |conn| {
            insert_unless_unfinished(conn, Domain::Project, &name, &name, &data)
        })
        .await
    }

    /// Inserts a pending history item unless one is unfinished for the same index.
    pub async fn enqueue_history(
        &self,
        project: &str,
        history: &History,
    ) -> Result<bool, JobStoreError> {
        let data = encode(history)?;
        let project = project.to_owned();
        let key = history.index.to_string();
        self.blocking("enqueue_history", move |conn| {
            insert_unless_unfinished(conn, Domain::History, &project, &key, &data)
        })
        .await
    }

    /// Claims and finalizes the oldest pending history item of `project`.
    pub async fn claim_next_history(&self, project: &str) -> Result<Option<History>, JobStoreError> {
        let project = project.to_owned();
        self.blocking("claim_next_history", move |conn| {
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .map_err(storage_err("begin history claim"))?;
            let claimed = claim_history_in(&tx, &project)?;
            tx.commit().map_err(storage_err("commit history claim"))?;
            Ok(claimed)
        })
        .await
    }

    /// Claims the oldest unfinished project item, advances it one stage and runs
    /// `stage` inside the same transaction.
    ///
    /// A failing stage rolls the status back and records the error on the item
    /// and in `<WorkingDir>/<Name>/error.txt`.
    pub async fn claim_next_project(
        &self,
        stage: &dyn ProjectStage,
        cancel: &CancellationToken,
    ) -> Result<ClaimOutcome, JobStoreError> {
        let db_path = self.db_path.clone();
        let busy_timeout = self.busy_timeout;
        let begun = tokio::task::spawn_blocking(move || begin_project_claim(&db_path, busy_timeout))
            .await
            .map_err(join_err("begin_project_claim"))??;
        let Some(claim) = begun else {
            return Ok(ClaimOutcome::NoWorkAvailable);
        };

        let ctx = StageContext {
            tx: Arc::clone(&claim.conn),
            project: claim.project.name.clone(),
            cancel: cancel.clone(),
        };
        tracing::info!(
            work_id = claim.work_id,
            project = %claim.project.name,
            status = %claim.from,
            "running project stage"
        );
        let stage_result = stage.run(claim.from, &claim.project, &ctx).await;
        drop(ctx);

        let conn = Arc::clone(&claim.conn);
        let work_id = claim.work_id;
        let outcome = match stage_result {
            Ok(()) => tokio::task::spawn_blocking(move || commit_claim(&conn, work_id))
                .await
                .map_err(join_err("commit_project_claim"))?,
            Err(err) => Err(err.to_string()),
        };

        match outcome {
            Ok(()) => Ok(ClaimOutcome::Advanced {
                work_id: claim.work_id,
                project: claim.project,
                from: claim.from,
                to: claim.to,
            }),
            Err(message) => {
                let conn = Arc::clone(&claim.conn);
                let project = claim.project;
                let persisted = message.clone();
                tokio::task::spawn_blocking(move || {
                    rollback_claim(&conn, work_id, &persisted)?;
                    write_error_sidecar(&project, &persisted);
                    Ok::<_, JobStoreError>(())
                })
                .await
                .map_err(join_err("rollback_project_claim"))??;
                Err(JobStoreError::Stage { work_id, message })
            }
        }
    }

    pub async fn list_work(&self) -> Result<Vec<WorkItem>, JobStoreError> {
        self.blocking("list_work", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, domain, project, item_key, status, error, \
                     created_at_unix_ms, updated_at_unix_ms FROM work ORDER BY id",
                )
                .map_err(storage_err("prepare list_work"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                })
                .map_err(storage_err("query list_work"))?;

            let mut items = Vec::new();
            for row in rows {
                let (id, domain, project, item_key, status, error, created, updated) =
                    row.map_err(storage_err("read work row"))?;
                items.push(WorkItem {
                    id,
                    domain: Domain::parse(&domain)?,
                    project,
                    item_key,
                    status: WorkStatus::parse(&status)?,
                    error,
                    created_at_unix_ms: created,
                    updated_at_unix_ms: updated,
                });
            }
            Ok(items)
        })
        .await
    }

    async fn blocking<T, F>(&self, task: &'static str, f: F) -> Result<T, JobStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, JobStoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path, busy_timeout)?;
            f(&mut conn)
        })
        .await
        .map_err(join_err(task))?
    }
}

/// Handle given to a stage handler while its claim transaction is open.
pub struct StageContext {
    tx: Arc<Mutex<Connection>>,
    project: String,
    cancel: CancellationToken,
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

impl StageContext {
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Claims the next pending history item of this project within the open
    /// transaction, so a failed stage returns it to the queue.
    pub async fn next_history(&self) -> Result<Option<History>, JobStoreError> {
        let tx = Arc::clone(&self.tx);
        let project = self.project.clone();
        tokio::task::spawn_blocking(move || {
            let conn = tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            claim_history_in(&conn, &project)
        })
        .await
        .map_err(join_err("next_history"))?
    }
}

struct ProjectClaim {
    conn: Arc<Mutex<Connection>>,
    work_id: i64,
    project: Project,
    from: WorkStatus,
    to: WorkStatus,
}

fn begin_project_claim(
    db_path: &Path,
    busy_timeout: Duration,
) -> Result<Option<ProjectClaim>, JobStoreError> {
    let conn = open_connection(db_path, busy_timeout)?;
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(storage_err("begin project claim"))?;

    match advance_oldest_project(&conn) {
        Ok(Some((work_id, project, from, to))) => Ok(Some(ProjectClaim {
            conn: Arc::new(Mutex::new(conn)),
            work_id,
            project,
            from,
            to,
        })),
        Ok(None) => {
            conn.execute_batch("ROLLBACK;")
                .map_err(storage_err("release empty claim"))?;
            Ok(None)
        }
        Err(err) => {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK;") {
                tracing::warn!("rollback after failed claim: {rollback_err}");
            }
            Err(err)
        }
    }
}

type AdvancedProject = (i64, Project, WorkStatus, WorkStatus);

fn advance_oldest_project(conn: &Connection) -> Result<Option<AdvancedProject>, JobStoreError> {
    let row = conn
        .query_row(
            "SELECT id, status, data FROM work \
             WHERE domain = 'project' AND status != 'done' \
             ORDER BY id LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            },
        )
        .optional()
        .map_err(storage_err("select claimable project"))?;
    let Some((work_id, status, data)) = row else {
        return Ok(None);
    };

    let from = WorkStatus::parse(&status)?;
    let to = from
        .next_project_stage()
        .ok_or_else(|| JobStoreError::Storage(format!("work item {work_id} is already done")))?;
    let project: Project = decode(&data)?;
    conn.execute(
        "UPDATE work SET status = ?1, error = NULL, updated_at_unix_ms = ?2 WHERE id = ?3",
        params![to.as_str(), now_unix_ms(), work_id],
    )
    .map_err(storage_err("advance project status"))?;
    Ok(Some((work_id, project, from, to)))
}

fn commit_claim(conn: &Mutex<Connection>, work_id: i64) -> Result<(), String> {
    let conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    conn.execute_batch("COMMIT;")
        .map_err(|err| format!("commit work item {work_id}: {err}"))
}

fn rollback_claim(conn: &Mutex<Connection>, work_id: i64, message: &str) -> Result<(), JobStoreError> {
    let conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if !conn.is_autocommit() {
        conn.execute_batch("ROLLBACK;")
            .map_err(storage_err("rollback project claim"))?;
    }
    conn.execute(
        "UPDATE work SET error = ?1, updated_at_unix_ms = ?2 WHERE id = ?3",
        params![message, now_unix_ms(), work_id],
    )
    .map_err(storage_err("persist stage error"))?;
    Ok(())
}

fn write_error_sidecar(project: &Project, message: &str) {
    let dir = project.dir();
    let written = fs::create_dir_all(&dir).and_then(|()| fs::write(project.error_file(), message));
    if let Err(err) = written {
        tracing::warn!(
            project = %project.name,
            path = %project.error_file().display(),
            "could not write error sidecar: {err}"
        );
    }
}

fn claim_history_in(conn: &Connection, project: &str) -> Result<Option<History>, JobStoreError> {
    let row = conn
        .query_row(
            "SELECT id, data FROM work \
             WHERE domain = 'history' AND project = ?1 AND status = 'pending' \
             ORDER BY id LIMIT 1",
            params![project],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )
        .optional()
        .map_err(storage_err("select pending history"))?;
    let Some((work_id, data)) = row else {
        return Ok(None);
    };

    conn.execute(
        "UPDATE work SET status = 'done', updated_at_unix_ms = ?1 WHERE id = ?2",
        params![now_unix_ms(), work_id],
    )
    .map_err(storage_err("finish history item"))?;
    decode(&data).map(Some)
}

fn insert_unless_unfinished(
    conn: &mut Connection,
    domain: Domain,
    project: &str,
    item_key: &str,
    data: &[u8],
) -> Result<bool, JobStoreError> {
    let now = now_unix_ms();
    let inserted = conn
        .execute(
            "INSERT INTO work \
               (domain, project, item_key, status, data, error, created_at_unix_ms, updated_at_unix_ms) \
             SELECT ?1, ?2, ?3, 'pending', ?4, NULL, ?5, ?5 \
             WHERE NOT EXISTS ( \
               SELECT 1 FROM work \
               WHERE domain = ?1 AND project = ?2 AND item_key = ?3 AND status != 'done' \
             )",
            params![domain.as_str(), project, item_key, data, now],
        )
        .map_err(storage_err("insert work item"))?;
    if inserted == 0 {
        tracing::debug!(
            domain = domain.as_str(),
            project,
            item_key,
            "work item already queued"
        );
    }
    Ok(inserted == 1)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, JobStoreError> {
    serde_json::to_vec(value).map_err(|err| JobStoreError::Payload(err.to_string()))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, JobStoreError> {
    serde_json::from_slice(data).map_err(|err| JobStoreError::Payload(err.to_string()))
}

pub(crate) fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, JobStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|err| {
        JobStoreError::Storage(format!("open sqlite {}: {err}", path.display()))
    })?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(storage_err("set PRAGMA journal_mode=WAL"))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(storage_err("set PRAGMA synchronous=NORMAL"))?;
    conn.busy_timeout(busy_timeout)
        .map_err(storage_err("set sqlite busy_timeout"))?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> Result<(), JobStoreError> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .map_err(storage_err("read PRAGMA user_version"))?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS work (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  domain TEXT NOT NULL CHECK (domain IN ('project', 'history')),
                  project TEXT NOT NULL,
                  item_key TEXT NOT NULL,
                  status TEXT NOT NULL,
                  data BLOB NOT NULL,
                  error TEXT,
                  created_at_unix_ms INTEGER NOT NULL,
                  updated_at_unix_ms INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS work_claim_idx
                  ON work(domain, project, status, id);
                "#,
            )
            .map_err(storage_err("create job store schema v1"))?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(storage_err("set PRAGMA user_version=1"))?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => Err(JobStoreError::Storage(format!(
            "unsupported job store schema version {user_version} (expected {SCHEMA_VERSION})"
        ))),
    }
}
