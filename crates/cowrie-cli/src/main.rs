//! Cowrie CLI - run shell scripts in a sandbox
//!
//! Usage:
//!   cowrie -c "command"        Execute a command string
//!   cowrie script.sh ...       Execute script files in order
//!   cowrie                     Interactive on a terminal, otherwise read stdin
//!
//! Paths are jailed to `--root` directories (the current directory when none
//! is given). The host `PATH` is passed through unless configured.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cowrie::{ExitStatus, Session, SessionConfig};
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "cowrie", version, about = "Run shell scripts in a sandbox")]
struct Cli {
    /// Directory the script may access; repeatable
    #[arg(long = "root", value_name = "DIR")]
    roots: Vec<PathBuf>,

    /// Initial working directory, inside a root
    #[arg(long, value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// JSON configuration file; flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Grace period in milliseconds between interrupt and kill on cancel
    #[arg(long, value_name = "N")]
    timeout_ms: Option<u64>,

    /// Refuse commands matching a glob pattern; repeatable
    #[arg(long, value_name = "PATTERN")]
    deny: Vec<String>,

    /// Seed an environment variable; repeatable
    #[arg(long, value_name = "NAME=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Run SCRIPT instead of reading files or stdin
    #[arg(short = 'c', value_name = "SCRIPT", conflicts_with = "files")]
    command: Option<String>,

    /// Script files, run in order
    files: Vec<PathBuf>,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

impl Cli {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_file(path)?,
            None => SessionConfig::default(),
        };
        if !self.roots.is_empty() {
            config.roots = self.roots.clone();
        }
        if config.roots.is_empty() {
            config
                .roots
                .push(std::env::current_dir().context("cannot determine current directory")?);
        }
        if self.workdir.is_some() {
            config.workdir = self.workdir.clone();
        }
        if let Some(ms) = self.timeout_ms {
            config.max_timeout = Some(Duration::from_millis(ms));
        }
        config.deny.extend(self.deny.iter().cloned());
        for (name, value) in &self.env {
            config
                .env
                .insert(name.clone(), serde_json::Value::String(value.clone()));
        }
        // External programs are looked up on the session PATH
        if !config.env.contains_key("PATH")
            && let Ok(path) = std::env::var("PATH")
        {
            config.env.insert("PATH".to_string(), path.into());
        }
        Ok(config)
    }
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let session = Session::builder()
        .config(cli.session_config()?)
        .on_exit(|code| std::process::exit(code))
        .build()
        .context("failed to set up sandbox")?;

    let cancel = session.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            cancel.cancel();
        }
    });

    if let Some(script) = &cli.command {
        return Ok(session.run_script(script).await?);
    }

    if !cli.files.is_empty() {
        let mut status = ExitStatus::SUCCESS;
        for file in &cli.files {
            status = session
                .run_path(file)
                .await
                .with_context(|| format!("{}", file.display()))?;
        }
        return Ok(status);
    }

    if std::io::stdin().is_terminal() {
        let status = session
            .run_interactive(BufReader::new(tokio::io::stdin()))
            .await?;
        return Ok(status);
    }
    Ok(session.run_piped(tokio::io::stdin()).await?)
}

#[tokio::main]
async fn main() {
    // Logs go to stderr so they never mix with script output
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(status) => std::process::exit(status.code()),
        Err(e) => {
            eprintln!("cowrie: {e:#}");
            std::process::exit(ExitStatus::FAILURE.code());
        }
    }
}
