//! Relaybox server
//!
//! Serves interactive code execution sessions over websockets.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relaybox::{
    Config, EXAMPLE_CONFIG, Language, Launcher, SandboxKind, SessionCoordinator, WorkspaceStore,
    prepare_cgroup,
};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

mod ws;

#[derive(Parser)]
#[command(name = "relaybox")]
#[command(about = "Interactive sandboxed code execution over websockets")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve interactive sessions
    Serve {
        /// Address to listen on
        #[arg(short, long, env = "RELAYBOX_BIND", default_value = "0.0.0.0:8000")]
        bind: SocketAddr,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path (default: relaybox.toml)
        #[arg(short, long, default_value = "relaybox.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// List configured languages
    Languages,

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::parse_toml(EXAMPLE_CONFIG).context("failed to load default configuration")?
    };

    match cli.command {
        Commands::Serve { bind } => {
            prepare_sandbox(&mut config);
            serve(config, bind).await
        }
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Languages => {
            list_languages(&config);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

/// Set up the cgroup hierarchy when isolate runs with cgroup limits
fn prepare_sandbox(config: &mut Config) {
    if config.backend != SandboxKind::Isolate || !config.cgroup {
        return;
    }
    match prepare_cgroup(&config.cg_root) {
        Ok(true) => debug!("cgroup hierarchy ready"),
        Ok(false) => {
            warn!(
                "cgroup support unavailable (memory controller not found), falling back to RLIMIT_AS"
            );
            config.cgroup = false;
        }
        Err(e) => {
            warn!("cgroup setup failed: {e}, falling back to RLIMIT_AS memory limiting");
            config.cgroup = false;
        }
    }
}

async fn serve(config: Config, bind: SocketAddr) -> Result<()> {
    tokio::fs::create_dir_all(&config.exec_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create workspace directory '{}'",
                config.exec_dir.display()
            )
        })?;

    if config.backend == SandboxKind::Process {
        warn!("process backend has no filesystem isolation, use it for development only");
    }

    let store = WorkspaceStore::new(config.exec_dir.clone());
    let settings = config.session.clone();
    let launcher = Arc::new(Launcher::new(Arc::new(config)));
    let coordinator = Arc::new(SessionCoordinator::new(launcher, store, settings));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, "listening");

    axum::serve(listener, ws::router(coordinator))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn list_languages(config: &Config) {
    println!("Available languages:\n");

    let mut languages: Vec<_> = config.languages.iter().collect();
    languages.sort_by_key(|(id, _)| *id);

    for (id, toolchain) in languages {
        let kind = match id.parse::<Language>() {
            Ok(language) if language.is_compiled() => "compiled",
            Ok(_) => "interpreted",
            Err(_) => "unknown",
        };
        println!("  {:<15} {} ({})", id, toolchain.name, kind);
    }
}

fn show_config(config: &Config) {
    println!("Workspace directory: {}", config.exec_dir.display());
    println!("Sandbox backend: {:?}", config.backend);
    if config.backend == SandboxKind::Isolate {
        println!("Isolate binary: {}", config.isolate_binary().display());
        println!(
            "Box pool: {} boxes from id {}",
            config.box_pool.count, config.box_pool.first_id
        );
        println!("cgroup limits: {}", config.cgroup);
    }
    println!();
    println!("Default resource limits:");
    println!("  Time limit: {:?}", config.default_limits.time_limit);
    println!(
        "  Wall time limit: {:?}",
        config.default_limits.wall_time_limit
    );
    println!(
        "  Memory limit: {:?} KB",
        config.default_limits.memory_limit
    );
    println!("  Stack limit: {:?} KB", config.default_limits.stack_limit);
    println!("  Max processes: {:?}", config.default_limits.max_processes);
    println!();
    println!("Session:");
    println!("  Kill grace: {} ms", config.session.kill_grace_ms);
    println!("  Drain timeout: {} ms", config.session.drain_timeout_ms);
    println!();
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
