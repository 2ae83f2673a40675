//! webbox - 单页站点及其容器构建 / 运行生命周期工具
//!
//! Usage:
//! - Serve the site: `webbox serve` (HOST / PORT from the environment)
//! - Check project files: `webbox check`
//! - Simulate the layered build: `webbox plan [--no-cache] [--index FILE]`
//! - Container lifecycle: `webbox build|run|stop|rm|logs|shell|status`
//! - Compose: `webbox up [--build]`, `webbox down`

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webbox::config::{EnvConfig, ProjectConfig};
use webbox::domain::compose::BindMount;
use webbox::domain::container::EnvVar;
use webbox::domain::descriptor::BuildDescriptor;
use webbox::domain::step::{LogLine, StepRecord};
use webbox::error::{BuildError, LifecycleError};
use webbox::infra::ProbeClient;
use webbox::services::build::{
    BuildContext, BuildOptions, ImageBuilder, LayerCache, PackageIndex, PinnedIndex, StaticIndex,
};
use webbox::services::check::check_project;
use webbox::services::runtime::{DockerCli, RunRequest};

#[derive(Parser)]
#[command(name = "webbox", version)]
#[command(about = "Single-page site with its container build and run lifecycle")]
struct Cli {
    /// Project directory (build context); overrides WEBBOX_PROJECT_DIR
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web application
    Serve {
        /// Interface to bind (overrides HOST)
        #[arg(long)]
        host: Option<IpAddr>,
        /// Port to bind (overrides PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Check manifest, build descriptor and compose file
    Check,
    /// Simulate the layered build against the local layer cache
    Plan {
        /// Ignore cached layers
        #[arg(long)]
        no_cache: bool,
        /// Package index file (name==version per line); default accepts any pin
        #[arg(long)]
        index: Option<PathBuf>,
        /// Tag to write on success (default: WEBBOX_IMAGE)
        #[arg(long)]
        tag: Option<String>,
        /// Drop the layer cache before building
        #[arg(long)]
        reset: bool,
    },
    /// Build the image with docker
    Build {
        #[arg(long)]
        no_cache: bool,
    },
    /// Start a container from the image
    Run {
        /// Host port to publish (default: the process port)
        #[arg(long)]
        publish: Option<u16>,
        /// Bind mount host:container[:ro]
        #[arg(long = "overlay")]
        overlays: Vec<String>,
        /// Extra environment KEY=VALUE
        #[arg(short = 'e', long = "env")]
        env: Vec<String>,
    },
    /// Stop the container
    Stop,
    /// Remove the container
    Rm {
        #[arg(short, long)]
        force: bool,
    },
    /// Show container logs
    Logs {
        #[arg(short, long)]
        follow: bool,
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Open a shell inside the running container
    Shell {
        #[arg(long, default_value = "sh")]
        shell: String,
    },
    /// Show container state
    Status,
    /// docker compose up -d
    Up {
        /// Rebuild images first
        #[arg(long)]
        build: bool,
    },
    /// docker compose down
    Down,
    /// Request the page and verify it
    Probe {
        /// Page URL (default: http://127.0.0.1:<PORT>/)
        #[arg(long)]
        url: Option<String>,
        /// Text the page must contain (default: the site heading)
        #[arg(long)]
        marker: Option<String>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("webbox=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).json())
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    // Ctrl-C 取消正在运行的子进程 / 停止服务
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down");
            signal_token.cancel();
        }
    });

    match dispatch(cli, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<LifecycleError>()
                .map(LifecycleError::exit_code)
                .unwrap_or(1);
            error!(exit_code = code, "{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(code as u8)
        }
    }
}

async fn dispatch(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let env = EnvConfig::from_env();
    let mut project = ProjectConfig::from_env();
    if let Some(root) = cli.project {
        project = project.with_root(root);
    }
    let docker = DockerCli::new(&project.root);

    match cli.command {
        Commands::Serve { host, port } => {
            let config = env.with_overrides(host, port);
            webbox::run_server(config, cancel).await?;
        }
        Commands::Check => check(&project, &env)?,
        Commands::Plan {
            no_cache,
            index,
            tag,
            reset,
        } => plan(&project, no_cache, index, tag, reset)?,
        Commands::Build { no_cache } => {
            let (tx, printer) = log_printer();
            let result = docker.build(&project, no_cache, tx, cancel).await;
            let _ = printer.await;
            result?;
            println!("Built {}", project.image);
        }
        Commands::Run {
            publish,
            overlays,
            env: extra,
        } => {
            let request = RunRequest {
                image: project.image.clone(),
                name: project.container_name.clone(),
                binding: env.bind,
                host_port: publish,
                overlays: parse_overlays(&project, &overlays)?,
                env: parse_env_vars(&extra)?,
            };
            let id = docker.run(&request).await?;
            println!(
                "Started {} ({}) publishing {}",
                request.name,
                id.chars().take(12).collect::<String>(),
                request.mapping()
            );
        }
        Commands::Stop => docker.stop(&project.container_name).await?,
        Commands::Rm { force } => docker.remove(&project.container_name, force).await?,
        Commands::Logs { follow, tail } => {
            docker.logs(&project.container_name, follow, tail).await?
        }
        Commands::Shell { shell } => docker.shell(&project.container_name, &shell).await?,
        Commands::Status => {
            let containers = docker.status(&project.container_name).await?;
            if containers.is_empty() {
                println!("No container named {}", project.container_name);
            }
            for c in containers {
                println!(
                    "{}  {}  {}  {}  {}",
                    c.name,
                    c.image,
                    c.state,
                    c.status,
                    c.ports.join(", ")
                );
            }
        }
        Commands::Up { build } => {
            let (tx, printer) = log_printer();
            let result = docker
                .compose_up(&project.compose_path(), build, tx, cancel)
                .await;
            let _ = printer.await;
            result?;
        }
        Commands::Down => {
            let (tx, printer) = log_printer();
            let result = docker.compose_down(&project.compose_path(), tx, cancel).await;
            let _ = printer.await;
            result?;
        }
        Commands::Probe { url, marker } => {
            let url = url.unwrap_or_else(|| format!("http://127.0.0.1:{}/", env.bind.port));
            let mut client = ProbeClient::new(Duration::from_secs(10))
                .context("cannot create HTTP client")?;
            if let Some(marker) = marker {
                client = client.with_marker(marker);
            }
            let report = client
                .probe(&url)
                .await
                .map_err(|e| LifecycleError::Runtime(format!("{}: {}", url, e)))?;
            println!(
                "{} -> {} ({}ms), marker {}",
                report.url,
                report.status,
                report.elapsed_ms,
                if report.marker_found { "found" } else { "missing" }
            );
            if !report.is_healthy() {
                return Err(LifecycleError::Runtime(format!("{} did not serve the page", url)).into());
            }
        }
    }
    Ok(())
}

fn check(project: &ProjectConfig, env: &EnvConfig) -> anyhow::Result<()> {
    let report = check_project(project, env, |key| std::env::var(key).ok())
        .map_err(LifecycleError::from)?;
    for finding in &report.findings {
        println!("{}", finding);
    }
    for service in &report.services {
        for overlay in &service.overlays {
            println!(
                "info: {}: overlay {} -> {}{}",
                service.name,
                overlay.host,
                overlay.container,
                if overlay.read_only { " (ro)" } else { "" }
            );
        }
    }
    println!(
        "{} error(s), {} warning(s), {} requirement(s)",
        report.errors(),
        report.warnings(),
        report.requirements
    );
    if report.has_errors() {
        anyhow::bail!("project check failed");
    }
    Ok(())
}

fn plan(
    project: &ProjectConfig,
    no_cache: bool,
    index: Option<PathBuf>,
    tag: Option<String>,
    reset: bool,
) -> anyhow::Result<()> {
    let build_err = |e: BuildError| anyhow::Error::from(LifecycleError::from(e));

    let path = project.dockerfile_path();
    let text = fs::read_to_string(&path).map_err(|_| build_err(BuildError::FileMissing(path)))?;
    let descriptor = BuildDescriptor::parse(&text).map_err(|e| build_err(e.into()))?;
    let context = BuildContext::open(&project.root).map_err(|e| build_err(e.into()))?;

    let index: Box<dyn PackageIndex> = match index {
        Some(path) => {
            let index = StaticIndex::load(&path)
                .map_err(|e| LifecycleError::Config(format!("{:#}", e)))?;
            if index.is_empty() {
                warn!(path = %path.display(), "Package index lists no packages; every install will fail");
            } else {
                info!(path = %path.display(), packages = index.len(), "Loaded package index");
            }
            Box::new(index)
        }
        None => Box::new(PinnedIndex),
    };

    let mut cache = LayerCache::open(&project.cache_dir()).map_err(build_err)?;
    if reset {
        cache.clear();
    }

    let options = BuildOptions {
        tag: tag.unwrap_or_else(|| project.image.clone()),
        manifest_name: project.manifest_name().to_string(),
        no_cache,
    };
    let mut builder = ImageBuilder::new(&context, index.as_ref(), options);
    let result = builder.build(&descriptor, &mut cache);

    print_summary(builder.steps());
    // layers built before a failure stay cached
    cache.save().map_err(build_err)?;

    let report = result.map_err(build_err)?;
    println!(
        "Tagged {} as {} ({} cached, {} built)",
        report.tag,
        report.image_id,
        report.cached(),
        report.built()
    );
    Ok(())
}

fn print_summary(steps: &[StepRecord]) {
    println!("=== Build Summary ===");
    for step in steps {
        println!("{}", step.summary_line(steps.len()));
        if let Some(message) = &step.message {
            println!("    {}", message);
        }
    }
}

/// Relative overlay host paths are resolved against the project directory.
fn parse_overlays(project: &ProjectConfig, specs: &[String]) -> anyhow::Result<Vec<BindMount>> {
    specs
        .iter()
        .map(|spec| -> anyhow::Result<BindMount> {
            let mut mount = BindMount::parse(spec).ok_or_else(|| {
                LifecycleError::Config(format!(
                    "overlay '{}' must be host_path:container_path[:ro] with a ./ or / host path",
                    spec
                ))
            })?;
            if mount.host.starts_with('.') {
                let absolute = project.root.join(&mount.host);
                mount.host = absolute
                    .canonicalize()
                    .unwrap_or(absolute)
                    .display()
                    .to_string();
            }
            Ok(mount)
        })
        .collect()
}

fn parse_env_vars(specs: &[String]) -> anyhow::Result<Vec<EnvVar>> {
    specs
        .iter()
        .map(|spec| -> anyhow::Result<EnvVar> {
            let (key, value) = spec
                .split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| {
                    LifecycleError::Config(format!("environment '{}' must be KEY=VALUE", spec))
                })?;
            Ok(EnvVar::new(key, value))
        })
        .collect()
}

/// Print streamed command output until every sender is dropped.
fn log_printer() -> (broadcast::Sender<LogLine>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = broadcast::channel::<LogLine>(1024);
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(line) if line.is_stderr() => eprintln!("{}", line.content),
                Ok(line) => println!("{}", line.content),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Output lines dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    (tx, handle)
}
