//! Docker CLI 封装
//!
//! 镜像构建、容器生命周期和 compose 编排都委托给 docker 命令行。
//! 容器端口始终取自进程配置的端口，与 `-e PORT=` 保持一致。

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProjectConfig;
use crate::domain::binding::{PortBinding, PortMapping};
use crate::domain::compose::BindMount;
use crate::domain::container::{ContainerInfo, EnvVar, PS_FORMAT};
use crate::domain::step::LogLine;
use crate::error::{BuildError, LifecycleError, StartError};
use crate::infra::command::CommandRunner;

use super::preflight;

/// `docker run` 参数
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub image: String,
    pub name: String,
    /// What the process inside the container binds
    pub binding: PortBinding,
    /// Host port to publish on; defaults to the process port
    pub host_port: Option<u16>,
    pub overlays: Vec<BindMount>,
    pub env: Vec<EnvVar>,
}

impl RunRequest {
    pub fn mapping(&self) -> PortMapping {
        PortMapping::new(self.host_port.unwrap_or(self.binding.port), self.binding.port)
    }

    /// `docker create` arguments (after `docker`).
    pub fn create_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "-p".to_string(),
            self.mapping().to_string(),
            "-e".to_string(),
            EnvVar::new("HOST", self.binding.interface.to_string()).to_arg(),
            "-e".to_string(),
            EnvVar::new("PORT", self.binding.port.to_string()).to_arg(),
        ];
        for var in &self.env {
            args.push("-e".to_string());
            args.push(var.to_arg());
        }
        for overlay in &self.overlays {
            args.push("-v".to_string());
            let mut spec = format!("{}:{}", overlay.host, overlay.container);
            if overlay.read_only {
                spec.push_str(":ro");
            }
            args.push(spec);
        }
        args.push(self.image.clone());
        args
    }
}

/// docker 命令行客户端
#[derive(Clone, Debug)]
pub struct DockerCli {
    program: String,
    /// Arguments placed before every subcommand
    prefix: Vec<String>,
    work_dir: PathBuf,
}

impl DockerCli {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self::with_command("docker", Vec::new(), work_dir)
    }

    /// Use another command line in place of `docker`, e.g. `sh wrapper.sh`.
    pub fn with_command(
        program: impl Into<String>,
        prefix: Vec<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            prefix,
            work_dir: work_dir.into(),
        }
    }

    fn argv(&self, args: Vec<String>) -> Vec<String> {
        self.prefix.iter().cloned().chain(args).collect()
    }

    /// docker build，输出实时转发到 `log_tx`
    pub async fn build(
        &self,
        project: &ProjectConfig,
        no_cache: bool,
        log_tx: broadcast::Sender<LogLine>,
        cancel: CancellationToken,
    ) -> Result<(), LifecycleError> {
        let dockerfile = project.dockerfile_path();
        if !dockerfile.is_file() {
            return Err(BuildError::FileMissing(dockerfile).into());
        }

        let mut args = vec![
            "build".to_string(),
            "-t".to_string(),
            project.image.clone(),
            "-f".to_string(),
            dockerfile.display().to_string(),
        ];
        if no_cache {
            args.push("--no-cache".to_string());
        }
        args.push(project.root.display().to_string());

        info!(image = %project.image, no_cache, "Running docker build");
        let status = CommandRunner::run_with_streaming(
            &self.program,
            &self.argv(args),
            &self.work_dir,
            log_tx,
            cancel,
        )
        .await?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            error!(image = %project.image, code, "docker build failed");
            return Err(BuildError::DockerFailed(code).into());
        }
        Ok(())
    }

    /// 启动容器
    ///
    /// The mapping and host port are checked first so a start-time error
    /// never leaves a container behind. The container is created and then
    /// started; only a container created by this call is removed when the
    /// start fails. A rejected create (e.g. the name is taken) touches nothing.
    pub async fn run(&self, request: &RunRequest) -> Result<String, LifecycleError> {
        preflight::check_publish(&request.mapping(), &request.binding)?;

        info!(
            image = %request.image,
            name = %request.name,
            mapping = %request.mapping(),
            "Creating container"
        );
        let output = CommandRunner::run_captured(
            &self.program,
            &self.argv(request.create_args()),
            &self.work_dir,
        )
        .await?;
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(name = %request.name, code, stderr = %stderr, "docker create failed");
            return Err(StartError::RuntimeRejected {
                name: request.name.clone(),
                code,
                stderr,
            }
            .into());
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let args = self.argv(vec!["start".to_string(), id.clone()]);
        let output = CommandRunner::run_captured(&self.program, &args, &self.work_dir).await?;
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(name = %request.name, id = %id, code, stderr = %stderr, "docker start failed, removing container");
            self.cleanup(&id).await;
            return Err(StartError::RuntimeRejected {
                name: request.name.clone(),
                code,
                stderr,
            }
            .into());
        }

        info!(name = %request.name, id = %id, "Container started");
        Ok(id)
    }

    /// Remove a container this process created. Takes the id, never the name.
    async fn cleanup(&self, id: &str) {
        let args = self.argv(vec!["rm".to_string(), "-f".to_string(), id.to_string()]);
        match CommandRunner::run_captured(&self.program, &args, &self.work_dir).await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(id, stderr = %stderr.trim(), "Failed to remove container");
            }
            Err(e) => warn!(id, error = %e, "Failed to remove container"),
        }
    }

    pub async fn stop(&self, name: &str) -> Result<(), LifecycleError> {
        self.simple(&["stop", name]).await
    }

    pub async fn remove(&self, name: &str, force: bool) -> Result<(), LifecycleError> {
        if force {
            self.simple(&["rm", "-f", name]).await
        } else {
            self.simple(&["rm", name]).await
        }
    }

    /// docker logs（继承终端）
    pub async fn logs(
        &self,
        name: &str,
        follow: bool,
        tail: Option<usize>,
    ) -> Result<(), LifecycleError> {
        let mut args = vec!["logs".to_string()];
        if follow {
            args.push("-f".to_string());
        }
        if let Some(tail) = tail {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        args.push(name.to_string());
        self.interactive(args).await
    }

    /// docker exec -it <name> <shell>
    pub async fn shell(&self, name: &str, shell: &str) -> Result<(), LifecycleError> {
        let args = vec![
            "exec".to_string(),
            "-it".to_string(),
            name.to_string(),
            shell.to_string(),
        ];
        self.interactive(args).await
    }

    /// Containers whose name is exactly `name`, running or not.
    pub async fn status(&self, name: &str) -> Result<Vec<ContainerInfo>, LifecycleError> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("name=^/{}$", name),
            "--format".to_string(),
            PS_FORMAT.to_string(),
        ];
        let output =
            CommandRunner::run_captured(&self.program, &self.argv(args), &self.work_dir).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LifecycleError::Runtime(format!(
                "docker ps failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(ContainerInfo::parse_ps_line)
            .collect())
    }

    /// docker compose up -d [--build]
    pub async fn compose_up(
        &self,
        compose_file: &Path,
        build: bool,
        log_tx: broadcast::Sender<LogLine>,
        cancel: CancellationToken,
    ) -> Result<(), LifecycleError> {
        let mut extra = vec!["up".to_string(), "-d".to_string()];
        if build {
            extra.push("--build".to_string());
        }
        let (program, args) = self.compose_command(compose_file, extra).await;
        info!(file = %compose_file.display(), build, "Running compose up");

        // stderr is collected so a failure can be reported with its cause
        let mut rx = log_tx.subscribe();
        let status =
            CommandRunner::run_with_streaming(&program, &args, &self.work_dir, log_tx, cancel)
                .await?;
        if status.success() {
            return Ok(());
        }

        // keeps the newest lines when the channel overflowed
        let mut stderr = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(line) if line.is_stderr() => stderr.push(line.content),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "Compose output lines dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Err(StartError::RuntimeRejected {
            name: compose_file.display().to_string(),
            code: status.code().unwrap_or(-1),
            stderr: stderr.join("\n"),
        }
        .into())
    }

    /// docker compose down
    pub async fn compose_down(
        &self,
        compose_file: &Path,
        log_tx: broadcast::Sender<LogLine>,
        cancel: CancellationToken,
    ) -> Result<(), LifecycleError> {
        let (program, args) = self
            .compose_command(compose_file, vec!["down".to_string()])
            .await;
        info!(file = %compose_file.display(), "Running compose down");
        let status =
            CommandRunner::run_with_streaming(&program, &args, &self.work_dir, log_tx, cancel)
                .await?;
        if !status.success() {
            return Err(LifecycleError::Runtime(format!(
                "compose down exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }

    async fn compose_command(
        &self,
        compose_file: &Path,
        extra: Vec<String>,
    ) -> (String, Vec<String>) {
        let (program, mut args) = if self.program == "docker" && self.prefix.is_empty() {
            let (program, prefix) = detect_compose_command().await;
            (
                program.to_string(),
                prefix.into_iter().map(str::to_string).collect::<Vec<_>>(),
            )
        } else {
            (self.program.clone(), self.argv(vec!["compose".to_string()]))
        };
        args.push("-f".to_string());
        args.push(compose_file.display().to_string());
        args.extend(extra);
        (program, args)
    }

    async fn simple(&self, args: &[&str]) -> Result<(), LifecycleError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output =
            CommandRunner::run_captured(&self.program, &self.argv(args.clone()), &self.work_dir)
                .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LifecycleError::Runtime(format!(
                "docker {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn interactive(&self, args: Vec<String>) -> Result<(), LifecycleError> {
        let status =
            CommandRunner::run_interactive(&self.program, &self.argv(args.clone()), &self.work_dir)
                .await?;
        if !status.success() {
            return Err(LifecycleError::Runtime(format!(
                "docker {} exited with status {}",
                args.first().map(String::as_str).unwrap_or(""),
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }
}

/// Detect which docker-compose command to use (prefer docker-compose, fallback to docker compose)
pub async fn detect_compose_command() -> (&'static str, Vec<&'static str>) {
    let check = Command::new("which").arg("docker-compose").output().await;

    if check.map(|o| o.status.success()).unwrap_or(false) {
        ("docker-compose", vec![])
    } else {
        ("docker", vec!["compose"])
    }
}
