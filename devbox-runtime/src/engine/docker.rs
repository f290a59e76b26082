use std::collections::HashMap;

use docktopus::DockerBuilder;
use docktopus::bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use docktopus::bollard::errors::Error as BollardError;
use docktopus::bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use docktopus::bollard::image::CreateImageOptions;
use docktopus::bollard::models::ContainerStateStatusEnum;
use futures_util::StreamExt;

use super::{ContainerEngine, EngineError, EngineResult, ExecAttachment, ExecOutput};
use crate::error::{Result, SandboxError};
use crate::registry::ContainerStatus;

/// Label stamped on every container this service creates.
pub const MANAGED_LABEL: &str = "devbox.managed";

/// Knobs for the Docker adapter.
#[derive(Clone, Debug)]
pub struct DockerSettings {
    /// Interactive shell started for terminal sessions.
    pub shell: String,
    /// Seconds Docker waits after SIGTERM before SIGKILL on stop.
    pub stop_grace_secs: i64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            stop_grace_secs: 10,
        }
    }
}

/// [`ContainerEngine`] backed by a Docker daemon.
pub struct DockerEngine {
    builder: DockerBuilder,
    settings: DockerSettings,
}

impl DockerEngine {
    /// Connect to `docker_host`, or the local daemon when `None`.
    pub async fn connect(docker_host: Option<&str>, settings: DockerSettings) -> Result<Self> {
        let builder = match docker_host {
            Some(host) => DockerBuilder::with_address(host).await.map_err(|err| {
                SandboxError::EngineFailure(format!("Failed to connect to docker at {host}: {err}"))
            })?,
            None => DockerBuilder::new().await.map_err(|err| {
                SandboxError::EngineFailure(format!("Failed to connect to docker: {err}"))
            })?,
        };
        Ok(Self { builder, settings })
    }
}

fn classify(err: BollardError, context: &str) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(format!("{context}: {message}")),
        BollardError::DockerResponseServerError {
            status_code: 304,
            message,
        } => EngineError::NotModified(format!("{context}: {message}")),
        other => EngineError::Other(format!("{context}: {other}")),
    }
}

/// Registry failures during pull surface either as a 404 or as an error
/// message inside the progress stream.
fn classify_pull(err: BollardError, image: &str) -> EngineError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    let missing = matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    ) || lower.contains("not found")
        || lower.contains("manifest unknown")
        || lower.contains("pull access denied")
        || lower.contains("repository does not exist");
    if missing {
        EngineError::ImageNotFound(format!("{image}: {message}"))
    } else {
        EngineError::Other(format!("Failed to pull image {image}: {message}"))
    }
}

fn status_from_state(status: Option<ContainerStateStatusEnum>, running: bool) -> ContainerStatus {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(
            ContainerStateStatusEnum::RUNNING
            | ContainerStateStatusEnum::RESTARTING
            | ContainerStateStatusEnum::PAUSED,
        ) => ContainerStatus::Running,
        Some(
            ContainerStateStatusEnum::EXITED
            | ContainerStateStatusEnum::DEAD
            | ContainerStateStatusEnum::REMOVING,
        ) => ContainerStatus::Exited,
        _ if running => ContainerStatus::Running,
        _ => ContainerStatus::Exited,
    }
}

#[async_trait::async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        let client = self.builder.client();
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = client.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|err| classify_pull(err, image))?;
        }
        tracing::debug!(image, "image available");
        Ok(())
    }

    async fn create_container(&self, image: &str) -> EngineResult<String> {
        let client = self.builder.client();
        // tty + open stdin keep the default shell entrypoint alive.
        let config = BollardConfig {
            image: Some(image.to_string()),
            tty: Some(true),
            open_stdin: Some(true),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        };
        let response = client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|err| match classify(err, "Failed to create container") {
                EngineError::NotFound(msg) => EngineError::ImageNotFound(format!("{image}: {msg}")),
                other => other,
            })?;
        for warning in &response.warnings {
            tracing::warn!(image, %warning, "docker create warning");
        }
        Ok(response.id)
    }

    async fn start_container(&self, engine_id: &str) -> EngineResult<()> {
        self.builder
            .client()
            .start_container(engine_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| classify(err, "Failed to start container"))
    }

    async fn stop_container(&self, engine_id: &str) -> EngineResult<()> {
        let options = StopContainerOptions {
            t: self.settings.stop_grace_secs,
        };
        self.builder
            .client()
            .stop_container(engine_id, Some(options))
            .await
            .map_err(|err| classify(err, "Failed to stop container"))
    }

    async fn remove_container(&self, engine_id: &str) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.builder
            .client()
            .remove_container(engine_id, Some(options))
            .await
            .map_err(|err| classify(err, "Failed to remove container"))
    }

    async fn inspect_container(&self, engine_id: &str) -> EngineResult<Option<ContainerStatus>> {
        let inspect = self
            .builder
            .client()
            .inspect_container(engine_id, None::<InspectContainerOptions>)
            .await;
        match inspect {
            Ok(info) => {
                let state = info.state.unwrap_or_default();
                let running = state.running.unwrap_or(false);
                Ok(Some(status_from_state(state.status, running)))
            }
            Err(err) => match classify(err, "Failed to inspect container") {
                EngineError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn exec(&self, engine_id: &str, command: &[String]) -> EngineResult<ExecOutput> {
        let client = self.builder.client();
        let options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };
        let created = client
            .create_exec(engine_id, options)
            .await
            .map_err(|err| classify(err, "Failed to create exec"))?;

        let started = client
            .start_exec(&created.id, None::<StartExecOptions>)
            .await
            .map_err(|err| classify(err, "Failed to start exec"))?;

        let mut buf = Vec::new();
        match started {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    let chunk = chunk.map_err(|err| classify(err, "Exec output failed"))?;
                    buf.extend_from_slice(&chunk.into_bytes());
                }
            }
            StartExecResults::Detached => {
                return Err(EngineError::Other("Exec started detached".into()));
            }
        }

        let inspect = client
            .inspect_exec(&created.id)
            .await
            .map_err(|err| classify(err, "Failed to inspect exec"))?;

        Ok(ExecOutput {
            output: String::from_utf8_lossy(&buf).into_owned(),
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    async fn attach_shell(&self, engine_id: &str) -> EngineResult<ExecAttachment> {
        let client = self.builder.client();
        let options = CreateExecOptions {
            cmd: Some(vec![self.settings.shell.clone()]),
            env: Some(vec!["TERM=xterm-256color".to_string()]),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };
        let created = client
            .create_exec(engine_id, options)
            .await
            .map_err(|err| classify(err, "Failed to create shell exec"))?;

        let start = StartExecOptions {
            detach: false,
            tty: true,
            ..Default::default()
        };
        let started = client
            .start_exec(&created.id, Some(start))
            .await
            .map_err(|err| classify(err, "Failed to attach shell"))?;

        match started {
            StartExecResults::Attached { output, input } => Ok(ExecAttachment {
                exec_id: created.id,
                output: output
                    .map(|chunk| {
                        chunk
                            .map(|log| log.into_bytes())
                            .map_err(|err| EngineError::Other(format!("Shell output failed: {err}")))
                    })
                    .boxed(),
                input,
            }),
            StartExecResults::Detached => {
                Err(EngineError::Other("Shell exec started detached".into()))
            }
        }
    }
}
