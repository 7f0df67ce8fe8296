//! CLI entry point for Sigil.
//!
//! This binary provides the `sigil` command: operator subcommands over the
//! secrets core, run as a single principal holding a project-wide grant.

mod audit;
mod cli;
mod commands;
mod config;
mod strategies;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use sigil_store::{OpContext, Principal, Scope, ScopeGrant, SecretsCore};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::audit::AuditTrail;
use crate::cli::{Cli, Commands};
use crate::config::{LoggingConfig, SigilConfig};

/// Principal used when neither `--as` nor `SIGIL_ACTOR` is given.
const DEFAULT_ACTOR: &str = "operator";

/// Environment used when neither `--env` nor `SIGIL_ENV` is given.
const DEFAULT_ENVIRONMENT: &str = "dev";

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real environment variables still apply.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = SigilConfig::load(&cli.config)?;
    init_tracing(&config.logging);

    if let Commands::Keygen = cli.command {
        return commands::keygen();
    }

    let session = Session::open(&cli, &config).await?;
    let trail = AuditTrail::spawn(session.core.events());

    let outcome = commands::dispatch(&session, cli.command).await;

    let logged = trail.finish().await;
    debug!(logged, "audit trail closed");
    outcome
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything a subcommand needs: the core, the caller and its scope.
pub struct Session {
    pub core: SecretsCore,
    pub ctx: OpContext,
    pub project: String,
    pub environment: String,
    pub json: bool,
    pub config: SigilConfig,
}

impl Session {
    async fn open(cli: &Cli, config: &SigilConfig) -> Result<Self> {
        let actor = cli
            .actor
            .clone()
            .or_else(|| config.defaults.actor.clone())
            .unwrap_or_else(|| DEFAULT_ACTOR.to_string());
        let Some(project) = cli.project.clone().or_else(|| config.defaults.project.clone()) else {
            bail!("no project given (use --project or SIGIL_PROJECT)");
        };
        let environment = cli
            .environment
            .clone()
            .or_else(|| config.defaults.environment.clone())
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

        let key = config::master_key(|name| std::env::var(name).ok())?;
        let principal = Principal::new(actor).with_grant(ScopeGrant::project_wide(project.clone()));

        let db_path = config.database.path.clone();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let core = SecretsCore::open(
            db_path.clone(),
            strategies::builtin_registry(),
            config.store_config(),
        )
        .await
        .with_context(|| format!("failed to open {}", db_path.display()))?;

        info!(actor = %principal.id, %project, %environment, "session ready");

        Ok(Self {
            core,
            ctx: OpContext::new(principal, key),
            project,
            environment,
            json: cli.json,
            config: config.clone(),
        })
    }

    /// The session's project and environment at `path`.
    pub fn scope(&self, path: &str) -> Result<Scope> {
        Ok(Scope::new(self.project.clone(), self.environment.clone(), path)?)
    }

    /// Print `value` as JSON when `--json` is set, otherwise with `text`.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text(value);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.  Logs go to
/// stderr so stdout carries only command output.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .init();
    }
}
