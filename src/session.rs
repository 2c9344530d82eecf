use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::{
    jobs::JobStore,
    model::{History, Project, project_dir},
    recorder::{HistoryListener, RecorderState},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectNameError {
    reason: String,
}

impl ProjectNameError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ProjectNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for ProjectNameError {}

/// Project names become directory names, so they must be a single safe path component.
pub fn validate_project_name(name: &str) -> Result<(), ProjectNameError> {
    if name.trim().is_empty() {
        return Err(ProjectNameError::new("project name cannot be empty"));
    }
    if name != name.trim() {
        return Err(ProjectNameError::new(
            "project name cannot have leading or trailing whitespace",
        ));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(ProjectNameError::new(
            "project name cannot contain path separators",
        ));
    }
    if name == "." || name == ".." {
        return Err(ProjectNameError::new("project name cannot be `.` or `..`"));
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    Invalid(String),
    Conflict(String),
    /// The remote worker answered with a non-2xx status.
    Rejected { status: u16, body: String },
    Unavailable(String),
    Storage(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(message) => write!(f, "invalid record: {message}"),
            Self::Conflict(message) => write!(f, "conflict: {message}"),
            Self::Rejected { status, body } => {
                write!(f, "worker rejected record with status {status}: {body}")
            }
            Self::Unavailable(message) => write!(f, "worker unavailable: {message}"),
            Self::Storage(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for SinkError {}

/// Destination for captured records.
#[async_trait]
pub trait ProjectSink: Send + Sync {
    async fn save_project(&self, project: Project) -> Result<(), SinkError>;
    async fn save_history(&self, project: &str, history: History) -> Result<(), SinkError>;
}

/// Enqueues straight into an in-process job store.
#[derive(Debug, Clone)]
pub struct LocalSink {
    store: JobStore,
}

impl LocalSink {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }
}

#[async_trait]
impl ProjectSink for LocalSink {
    async fn save_project(&self, project: Project) -> Result<(), SinkError> {
        validate_project_name(&project.name).map_err(|err| SinkError::Invalid(err.to_string()))?;

        let dir = project.dir();
        let working_dir = project.working_dir.clone();
        let created = tokio::task::spawn_blocking(move || create_project_dir(&working_dir, &dir))
            .await
            .map_err(|err| SinkError::Storage(format!("join create_project_dir task: {err}")))?;
        match created {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(SinkError::Conflict(format!(
                    "project directory {} already exists",
                    project.dir().display()
                )));
            }
            Err(err) => {
                return Err(SinkError::Storage(format!(
                    "create project directory {}: {err}",
                    project.dir().display()
                )));
            }
        }

        let name = project.name.clone();
        let inserted = self
            .store
            .enqueue_project(&project)
            .await
            .map_err(|err| SinkError::Storage(err.to_string()))?;
        if !inserted {
            return Err(SinkError::Conflict(format!("project `{name}` is already queued")));
        }
        tracing::info!(project = %name, "project enqueued");
        Ok(())
    }

    async fn save_history(&self, project: &str, history: History) -> Result<(), SinkError> {
        validate_project_name(project).map_err(|err| SinkError::Invalid(err.to_string()))?;

        let index = history.index;
        let inserted = self
            .store
            .enqueue_history(project, &history)
            .await
            .map_err(|err| SinkError::Storage(err.to_string()))?;
        if !inserted {
            return Err(SinkError::Conflict(format!(
                "history {index} of project `{project}` is already queued"
            )));
        }
        tracing::debug!(project, index, "history enqueued");
        Ok(())
    }
}

fn create_project_dir(working_dir: &Path, dir: &Path) -> io::Result<()> {
    fs::create_dir_all(working_dir)?;
    fs::create_dir(dir)
}

#[derive(Debug)]
pub enum SessionError {
    InvalidName(ProjectNameError),
    Conflict(String),
    NotRecording,
    Sink(SinkError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(err) => write!(f, "{err}"),
            Self::Conflict(message) => write!(f, "{message}"),
            Self::NotRecording => write!(f, "no session is recording"),
            Self::Sink(err) => write!(f, "persist project: {err}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidName(err) => Some(err),
            Self::Sink(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub project: Option<String>,
    pub recording: bool,
}

#[derive(Debug, Default)]
struct GateState {
    project: Option<String>,
    recording: bool,
}

/// Decides whether captured traffic belongs to a project and persists it.
pub struct SessionGate {
    sink: Arc<dyn ProjectSink>,
    projects_dir: PathBuf,
    recorder_state: Arc<RecorderState>,
    state: RwLock<GateState>,
}

impl fmt::Debug for SessionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGate")
            .field("projects_dir", &self.projects_dir)
            .finish_non_exhaustive()
    }
}

impl SessionGate {
    pub fn new(
        sink: Arc<dyn ProjectSink>,
        projects_dir: PathBuf,
        recorder_state: Arc<RecorderState>,
    ) -> Self {
        Self {
            sink,
            projects_dir,
            recorder_state,
            state: RwLock::new(GateState::default()),
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    pub async fn start(&self, name: &str) -> Result<(), SessionError> {
        validate_project_name(name).map_err(SessionError::InvalidName)?;

        let mut state = self.state.write().await;
        if state.recording {
            let current = state.project.as_deref().unwrap_or_default();
            return Err(SessionError::Conflict(format!(
                "session `{current}` is already recording"
            )));
        }
        let dir = project_dir(&self.projects_dir, name);
        if dir.exists() {
            return Err(SessionError::Conflict(format!(
                "project directory {} already exists",
                dir.display()
            )));
        }

        self.recorder_state.reset();
        state.project = Some(name.to_owned());
        state.recording = true;
        tracing::info!(project = name, "session started");
        Ok(())
    }

    /// Stops recording, resets recorder state and hands the project to the sink.
    pub async fn stop(&self, desc: &str) -> Result<Project, SessionError> {
        let name = {
            let mut state = self.state.write().await;
            if !state.recording {
                return Err(SessionError::NotRecording);
            }
            state.recording = false;
            state.project.clone().unwrap_or_default()
        };
        self.recorder_state.reset();

        let project = Project {
            name,
            working_dir: self.projects_dir.clone(),
            desc: desc.to_owned(),
        };
        self.sink
            .save_project(project.clone())
            .await
            .map_err(SessionError::Sink)?;
        tracing::info!(project = %project.name, "session stopped");
        Ok(project)
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.state.read().await;
        SessionStatus {
            project: state.project.clone(),
            recording: state.recording,
        }
    }
}

#[async_trait]
impl HistoryListener for SessionGate {
    async fn notify(&self, history: History) {
        let state = self.state.read().await;
        if !state.recording {
            return;
        }
        let Some(project) = state.project.as_deref() else {
            return;
        };
        let index = history.index;
        if let Err(err) = self.sink.save_history(project, history).await {
            tracing::warn!(project, index, "dropping captured history: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::{
        LocalSink, ProjectSink, SessionError, SessionGate, SinkError, validate_project_name,
    };
    use crate::{
        jobs::{Domain, JobStore},
        model::{History, Project},
        recorder::{HistoryListener, RecorderState},
    };

    fn history(index: u64) -> History {
        History {
            index,
            args: vec!["curl".to_owned()],
            output: String::new(),
            exec_time: 1,
        }
    }

    #[derive(Default)]
    struct MemorySink {
        projects: Mutex<Vec<Project>>,
        histories: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl ProjectSink for MemorySink {
        async fn save_project(&self, project: Project) -> Result<(), SinkError> {
            self.projects.lock().expect("lock").push(project);
            Ok(())
        }

        async fn save_history(&self, project: &str, history: History) -> Result<(), SinkError> {
            self.histories
                .lock()
                .expect("lock")
                .push((project.to_owned(), history.index));
            Ok(())
        }
    }

    fn gate(dir: &Path) -> (SessionGate, Arc<MemorySink>, Arc<RecorderState>) {
        let sink = Arc::new(MemorySink::default());
        let state = Arc::new(RecorderState::new());
        let gate = SessionGate::new(sink.clone(), dir.to_path_buf(), Arc::clone(&state));
        (gate, sink, state)
    }

    #[test]
    fn validate_project_name_rejects_unsafe_names() {
        let cases = [
            "", " demo", "demo ", "../prod", "a/b", r"a\b", ".", "..",
        ];
        for case in cases {
            assert!(
                validate_project_name(case).is_err(),
                "case `{case}` should fail"
            );
        }
        assert!(validate_project_name("demo1").is_ok());
    }

    #[tokio::test]
    async fn history_is_forwarded_only_while_recording() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (gate, sink, _) = gate(temp.path());

        gate.notify(history(0)).await;
        gate.start("demo1").await.expect("start");
        gate.notify(history(1)).await;
        gate.stop("first demo").await.expect("stop");
        gate.notify(history(2)).await;

        assert_eq!(
            *sink.histories.lock().expect("lock"),
            vec![("demo1".to_owned(), 1)]
        );
        let projects = sink.projects.lock().expect("lock");
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "demo1");
        assert_eq!(projects[0].desc, "first demo");
        assert_eq!(projects[0].working_dir, temp.path());
    }

    #[tokio::test]
    async fn start_conflicts_while_recording_or_when_dir_exists() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (gate, _, _) = gate(temp.path());

        gate.start("demo1").await.expect("start");
        let err = gate.start("demo2").await.expect_err("already recording");
        assert!(matches!(err, SessionError::Conflict(_)), "unexpected: {err}");
        gate.stop("").await.expect("stop");

        std::fs::create_dir(temp.path().join("taken")).expect("mkdir");
        let err = gate.start("taken").await.expect_err("dir exists");
        assert!(matches!(err, SessionError::Conflict(_)), "unexpected: {err}");

        let err = gate.start("../escape").await.expect_err("bad name");
        assert!(matches!(err, SessionError::InvalidName(_)), "unexpected: {err}");
    }

    #[tokio::test]
    async fn stop_without_start_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (gate, sink, _) = gate(temp.path());

        let err = gate.stop("").await.expect_err("not recording");
        assert!(matches!(err, SessionError::NotRecording));
        assert!(sink.projects.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn status_reports_current_project() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (gate, _, _) = gate(temp.path());

        let idle = gate.status().await;
        assert_eq!(idle.project, None);
        assert!(!idle.recording);

        gate.start("demo1").await.expect("start");
        let status = gate.status().await;
        assert_eq!(status.project.as_deref(), Some("demo1"));
        assert!(status.recording);
    }

    #[tokio::test]
    async fn local_sink_conflicts_on_existing_directory() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let store = JobStore::open(temp.path().join("jobs.db"), Duration::from_secs(5))
            .expect("store");
        let sink = LocalSink::new(store.clone());
        let project = Project {
            name: "demo1".to_owned(),
            working_dir: temp.path().join("projects"),
            desc: String::new(),
        };

        sink.save_project(project.clone()).await.expect("first save");
        assert!(project.dir().is_dir());
        let err = sink.save_project(project).await.expect_err("second save");
        assert!(matches!(err, SinkError::Conflict(_)), "unexpected: {err}");

        let work = store.list_work().await.expect("list");
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].domain, Domain::Project);
    }

    #[tokio::test]
    async fn local_sink_rejects_duplicate_history_and_bad_names() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let store = JobStore::open(temp.path().join("jobs.db"), Duration::from_secs(5))
            .expect("store");
        let sink = LocalSink::new(store);

        sink.save_history("demo1", history(0)).await.expect("first");
        let err = sink
            .save_history("demo1", history(0))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, SinkError::Conflict(_)));
        let err = sink.save_history("..", history(1)).await.expect_err("bad name");
        assert!(matches!(err, SinkError::Invalid(_)));
    }
}
