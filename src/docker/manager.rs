// Docker Manager - Handles all Docker operations for the server container

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures_util::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("Docker connection error: {0}")]
    ConnectionError(#[from] bollard::errors::Error),

    #[error("Image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("Invalid command \"{command}\": {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("Exec failed: {0}")]
    ExecFailed(String),

    #[error("Log stream of {container} ended before \"{sentinel}\" was printed")]
    LogStreamEnded { container: String, sentinel: String },
}

/// Everything needed to create the server container
#[derive(Debug, Clone)]
pub struct ContainerSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub env: &'a HashMap<String, String>,
    pub cpuset: Option<&'a str>,
    /// Host directory mounted at `mount_path`
    pub data_path: &'a Path,
    pub mount_path: &'a str,
}

/// Exit code and combined stdout/stderr of an exec
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn log_text(output: LogOutput) -> String {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => String::from_utf8_lossy(&message).to_string(),
    }
}

/// Drain an exec output stream. A stream error fails the exec rather than
/// leaving the output cut short.
async fn collect_output<S>(mut stream: S) -> Result<String, DockerError>
where
    S: Stream<Item = Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    let mut output = String::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(chunk) => output.push_str(&log_text(chunk)),
            Err(e) => {
                return Err(DockerError::ExecFailed(format!(
                    "output stream failed after {} bytes: {}",
                    output.len(),
                    e
                )))
            }
        }
    }
    Ok(output)
}

/// Reassembles lines from log chunks that may split a line anywhere
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    /// Feed a chunk, returning the lines it completed
    pub(crate) fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }
}

pub struct DockerManager {
    docker: Docker,
}

impl DockerManager {
    /// Create a new Docker manager instance
    pub async fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Ping Docker to check if it's running
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Pull a Docker image
    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        tracing::info!("Pulling image: {}", image);
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!("Pulling {}: {}", image, status);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to pull image {}: {}", image, e);
                    return Err(DockerError::ImagePullFailed(e.to_string()));
                }
            }
        }

        tracing::info!("Successfully pulled image: {}", image);
        Ok(())
    }

    /// All containers, running or not, whose name is exactly `name`
    pub async fn list_by_name(&self, name: &str) -> Result<Vec<ContainerSummary>, DockerError> {
        let mut filters = HashMap::new();
        filters.insert("name", vec![name]);
        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });

        // The name filter matches substrings
        let wanted = format!("/{}", name);
        let containers = self.docker.list_containers(options).await?;
        Ok(containers
            .into_iter()
            .filter(|c| {
                c.names
                    .as_ref()
                    .map(|names| names.iter().any(|n| *n == wanted))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Create the server container. Returns the container ID.
    pub async fn create_container(&self, spec: &ContainerSpec<'_>) -> Result<String, DockerError> {
        let env_vars: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        tracing::debug!("Environment variable names: {:?}", spec.env.keys().collect::<Vec<_>>());

        let data_mount = format!("{}:{}", spec.data_path.to_string_lossy(), spec.mount_path);
        tracing::info!("Volume mount: {}", data_mount);
        if let Some(cpus) = spec.cpuset {
            tracing::info!("CPU affinity: {}", cpus);
        }

        // SRCDS picks its own ports, so the container shares the host network
        let host_config = HostConfig {
            binds: Some(vec![data_mount]),
            network_mode: Some("host".to_string()),
            cpuset_cpus: spec.cpuset.map(str::to_string),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.to_string()),
            env: Some(env_vars),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name,
            platform: None,
        });

        tracing::info!("Creating container: {}", spec.name);
        let response = self.docker.create_container(options, config).await?;
        tracing::info!("Container created with ID: {}", response.id);

        Ok(response.id)
    }

    /// Start a container
    pub async fn start_container(&self, container_id: &str) -> Result<(), DockerError> {
        tracing::info!("Starting container: {}", container_id);
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Stop a container
    pub async fn stop_container(&self, container_id: &str) -> Result<(), DockerError> {
        tracing::info!("Stopping container: {}", container_id);
        let options = Some(StopContainerOptions { t: 30 });
        self.docker.stop_container(container_id, options).await?;
        Ok(())
    }

    /// Kill a running container
    pub async fn kill_container(&self, container_id: &str) -> Result<(), DockerError> {
        tracing::info!("Killing container: {}", container_id);
        let options = Some(KillContainerOptions { signal: "SIGKILL" });
        self.docker.kill_container(container_id, options).await?;
        Ok(())
    }

    /// Restart a container
    pub async fn restart_container(&self, container_id: &str) -> Result<(), DockerError> {
        tracing::info!("Restarting container: {}", container_id);
        let options = Some(RestartContainerOptions { t: 30 });
        self.docker.restart_container(container_id, options).await?;
        Ok(())
    }

    /// Remove a container along with its anonymous volumes
    pub async fn remove_container(&self, container_id: &str) -> Result<(), DockerError> {
        tracing::info!("Removing container: {}", container_id);
        let options = Some(RemoveContainerOptions {
            force: false,
            v: true,
            ..Default::default()
        });
        self.docker.remove_container(container_id, options).await?;
        Ok(())
    }

    /// Follow the container's output until a line equal to `sentinel` appears.
    /// Output is echoed as it arrives.
    pub async fn wait_for_log_line(
        &self,
        container_id: &str,
        sentinel: &str,
    ) -> Result<(), DockerError> {
        let options = Some(LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        });

        let mut stream = self.docker.logs(container_id, options);
        let mut buffer = LineBuffer::default();

        while let Some(result) = stream.next().await {
            let text = log_text(result?);
            for line in buffer.push(&text) {
                tracing::info!("[{}] {}", container_id, line);
                if line == sentinel {
                    return Ok(());
                }
            }
        }

        Err(DockerError::LogStreamEnded {
            container: container_id.to_string(),
            sentinel: sentinel.to_string(),
        })
    }

    /// Run `command` inside a running container as `user`, collecting its output.
    /// The command is split with shell quoting rules but not run through a shell.
    pub async fn exec(
        &self,
        container_id: &str,
        user: &str,
        command: &str,
    ) -> Result<ExecOutput, DockerError> {
        let argv = shell_words::split(command).map_err(|e| DockerError::InvalidCommand {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!("Executing in container {} as {}: {:?}", container_id, user, argv);

        let exec_options = CreateExecOptions {
            cmd: Some(argv),
            user: Some(user.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container_id, exec_options)
            .await
            .map_err(|e| DockerError::ExecFailed(e.to_string()))?;

        let start_options = Some(StartExecOptions {
            detach: false,
            tty: false,
            ..Default::default()
        });

        let output = match self.docker.start_exec(&exec.id, start_options).await {
            Ok(StartExecResults::Attached { output, .. }) => collect_output(output).await?,
            Ok(StartExecResults::Detached) => {
                tracing::warn!("Exec started in detached mode unexpectedly");
                String::new()
            }
            Err(e) => return Err(DockerError::ExecFailed(e.to_string())),
        };

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| DockerError::ExecFailed(e.to_string()))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        tracing::info!("Exec finished with exit code: {}", exit_code);
        Ok(ExecOutput { exit_code, output })
    }
}
