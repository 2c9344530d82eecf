//! Default stage handler: materialises project artifacts for external renderers.

use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{
    config::HookConfig,
    jobs::{StageContext, WorkStatus},
    model::{Project, history_file_name},
    worker::{ProjectStage, StageError},
};

pub const PROJECT_FILE_NAME: &str = "project.json";

#[derive(Debug, Clone, Default)]
pub struct ArtifactStage {
    hooks: HookConfig,
}

impl ArtifactStage {
    pub fn new(hooks: HookConfig) -> Self {
        Self { hooks }
    }

    async fn write_histories(&self, project: &Project, ctx: &StageContext) -> Result<usize, StageError> {
        let dir = project.dir();
        tokio::fs::create_dir_all(&dir).await?;

        let mut written = 0;
        while let Some(history) = ctx.next_history().await? {
            if ctx.cancellation().is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let body = serde_json::to_vec_pretty(&history)
                .map_err(|err| StageError::Other(format!("encode history {}: {err}", history.index)))?;
            tokio::fs::write(dir.join(history_file_name(history.index)), body).await?;
            written += 1;
        }
        Ok(written)
    }

    async fn write_project(&self, project: &Project) -> Result<(), StageError> {
        let dir = project.dir();
        tokio::fs::create_dir_all(&dir).await?;
        let body = serde_json::to_vec_pretty(project)
            .map_err(|err| StageError::Other(format!("encode project: {err}")))?;
        tokio::fs::write(dir.join(PROJECT_FILE_NAME), body).await?;
        Ok(())
    }
}

#[async_trait]
impl ProjectStage for ArtifactStage {
    async fn run(
        &self,
        stage: WorkStatus,
        project: &Project,
        ctx: &StageContext,
    ) -> Result<(), StageError> {
        match stage {
            WorkStatus::Pending => {
                let written = self.write_histories(project, ctx).await?;
                tracing::info!(project = %project.name, histories = written, "history artifacts written");
                if let Some(hook) = &self.hooks.history {
                    run_hook(hook, project, stage, ctx.cancellation()).await?;
                }
            }
            WorkStatus::Postprocessing => {
                self.write_project(project).await?;
                if let Some(hook) = &self.hooks.postprocess {
                    run_hook(hook, project, stage, ctx.cancellation()).await?;
                }
            }
            WorkStatus::Done => {
                return Err(StageError::Other(format!(
                    "project `{}` has no stage left to run",
                    project.name
                )));
            }
        }
        Ok(())
    }
}

async fn run_hook(
    argv: &[String],
    project: &Project,
    stage: WorkStatus,
    cancel: &CancellationToken,
) -> Result<(), StageError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(StageError::Hook("hook command is empty".to_owned()));
    };
    let dir = project.dir();
    tracing::info!(project = %project.name, stage = %stage, %program, "running hook");

    let mut child = Command::new(program)
        .args(args)
        .current_dir(&dir)
        .env("AUTODEMO_PROJECT", &project.name)
        .env("AUTODEMO_PROJECT_DIR", absolute(&dir))
        .env("AUTODEMO_STAGE", stage.as_str())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| StageError::Hook(format!("spawn `{program}`: {err}")))?;

    let status = tokio::select! {
        status = child.wait() => status
            .map_err(|err| StageError::Hook(format!("wait for `{program}`: {err}")))?,
        _ = cancel.cancelled() => {
            if let Err(err) = child.kill().await {
                tracing::warn!(%program, "kill cancelled hook: {err}");
            }
            return Err(StageError::Cancelled);
        }
    };

    if !status.success() {
        return Err(StageError::Hook(format!("`{program}` exited with {status}")));
    }
    Ok(())
}

fn absolute(path: &Path) -> std::path::PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
