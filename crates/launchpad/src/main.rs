use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{LevelFilter, debug, error, info, warn};
use tokio::net::TcpListener;

use launchpad::api::{AppState, create_router};
use launchpad::auth::AuthState;
use launchpad::config::{APP_NAME, AppConfig, AppPaths, write_default_config};
use launchpad::container::ContainerRuntimeApi;
use launchpad::db::Database;
use launchpad::session::{SessionService, SessionStore};
use launchpad::user::UserRepository;
use launchpad::workspace::WorkspaceProvisioner;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_reap(ctx: RuntimeContext) -> Result<()> {
    handle_reap(&ctx).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Reap => async_reap(ctx),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Launchpad - per-user RStudio and JupyterLab session orchestrator.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true, env = "LAUNCHPAD_CONFIG")]
    config: Option<std::path::PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server and the expiry reaper
    Serve(ServeCommand),
    /// Run one expiry sweep and exit
    Reap,
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = AppConfig::load(&paths.config_file)?;
        let paths = paths.apply_overrides(&config)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = self.effective_log_level();
        let level_name = level.to_string().to_lowercase();

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level_name},tower_http={level_name}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let disable_color = self.common.no_color
                || env::var_os("NO_COLOR").is_some()
                || !io::stderr().is_terminal();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // Also init env_logger for the log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(level);
        if self.common.no_color {
            builder.write_style(env_logger::WriteStyle::Never);
        }
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::from_str(&self.config.logging.level)
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    async fn open_database(&self) -> Result<Database> {
        let path = self.paths.database_path(&self.config)?;
        Database::new(&path).await
    }

    /// Wire the session service against the configured runtime and paths.
    async fn session_service(&self, db: &Database) -> Result<Arc<SessionService>> {
        let runtime = self.config.container_runtime();
        match runtime.health_check().await {
            Ok(version) => info!(
                "Container runtime {} ready: {}",
                runtime.runtime_type(),
                version.lines().next().unwrap_or_default()
            ),
            Err(e) => warn!(
                "Container runtime {} is not usable yet: {}",
                runtime.binary(),
                e
            ),
        }

        let workspaces = WorkspaceProvisioner::new(
            self.paths.workspace_dir(&self.config)?,
            self.paths.host_workspace_dir(&self.config)?,
        );
        let runtime: Arc<dyn ContainerRuntimeApi> = Arc::new(runtime);

        Ok(Arc::new(SessionService::new(
            SessionStore::new(db.pool().clone()),
            runtime,
            workspaces,
            self.config.session_service_config(),
        )))
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    ctx.config.validate()?;
    ctx.config.auth.validate().map_err(|e| anyhow!(e))?;

    let db = ctx.open_database().await?;
    let sessions = ctx.session_service(&db).await?;
    sessions
        .recover_interrupted()
        .await
        .context("recovering interrupted sessions")?;

    let reaper = if ctx.config.reaper.enabled {
        Some(Arc::clone(&sessions).start_reaper_task(ctx.config.reaper.interval_secs))
    } else {
        info!("Expiry reaper disabled");
        None
    };

    let users = UserRepository::new(db.pool().clone());
    let auth = AuthState::new(ctx.config.auth.clone(), users.clone());
    let state = AppState::new(sessions, users, auth, ctx.config.labs.clone());
    let app = create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("parsing listen address {}:{}", host, port))?;

    info!("Listening on http://{}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining requests...");
}

async fn handle_reap(ctx: &RuntimeContext) -> Result<()> {
    ctx.config.validate()?;
    let db = ctx.open_database().await?;
    let sessions = ctx.session_service(&db).await?;
    let report = sessions
        .reap_expired_at(Utc::now())
        .await
        .context("running expiry sweep")?;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing reap report")?
        );
    } else {
        println!(
            "attempted: {}, reclaimed: {}, failed: {}",
            report.attempted, report.reclaimed, report.failed
        );
        for id in &report.failures {
            println!("  failed: {}", id);
        }
    }

    if report.failed > 0 {
        return Err(anyhow!("{} session(s) could not be stopped", report.failed));
    }
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    write_default_config(&ctx.paths.config_file)?;
    std::fs::create_dir_all(&ctx.paths.data_dir).with_context(|| {
        format!("creating data directory {}", ctx.paths.data_dir.display())
    })?;
    info!("Wrote default config to {}", ctx.paths.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            // Never print the signing secret.
            let mut shown = ctx.config.clone();
            if shown.auth.jwt_secret.is_some() {
                shown.auth.jwt_secret = Some("[redacted]".to_string());
            }
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&shown).context("serializing config to JSON")?
                );
            } else {
                println!("{}", shown.to_toml()?);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
