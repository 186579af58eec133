//! `tenant-schema`: operator CLI for the schema lifecycle engine.
//!
//! # Usage
//!
//! ```bash
//! tenant-schema migrate setup
//! tenant-schema migrate tenant acme
//! tenant-schema validate all --json
//! tenant-schema heal acme
//! tenant-schema --mock check
//! ```
//!
//! Exit codes: `0` success, `1` unresolved failure or drift, `2` usage or
//! configuration error.

// CLI tools are expected to print to stdout/stderr
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod logging;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[cfg(feature = "pg")]
use anyhow::Context;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tenant_schema::{InMemoryBackend, SchemaError, SchemaLifecycle, Target, TenantSchemaConfig};
use tenant_schema_sdk::{TenantId, TenantState};

use crate::report::Printer;

/// Multi-tenant schema lifecycle engine
///
/// Migrates, validates and heals the shared namespace and every tenant namespace.
#[derive(Parser, Debug)]
#[command(name = "tenant-schema")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log verbosity (-v info, -vv debug, -vvv trace); `RUST_LOG` wins when set
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Run against an empty in-memory backend instead of PostgreSQL
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations
    Migrate {
        #[command(subcommand)]
        target: MigrateTarget,
    },
    /// Compare live namespaces with the registry (`<tenant-id>`, `public` or `all`)
    Validate { target: String },
    /// Repair drift non-destructively (`<tenant-id>` or `public`)
    Heal { target: String },
    /// List declared indexes missing from a namespace (`<tenant-id>` or `public`)
    Advise { target: String },
    /// List migration versions not yet applied (`<tenant-id>` or `public`)
    Pending { target: String },
    /// Verify configuration, definitions and connectivity
    Check,
}

#[derive(Subcommand, Debug)]
enum MigrateTarget {
    /// Migrate the shared namespace
    Public,
    /// Provision and migrate one tenant namespace
    Tenant { id: String },
    /// Shared bootstrap: catalog tables and shared migrations
    Setup,
}

/// Process outcome, mapped to the exit code.
enum Outcome {
    Ok,
    /// Command ran but found unresolved drift or failures.
    Unresolved,
}

const EXIT_UNRESOLVED: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match TenantSchemaConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };
    logging::init(cli.verbose, config.logging.format);

    let printer = Printer::new(cli.json);
    match run(&cli, config, &printer).await {
        Ok(Outcome::Ok) => ExitCode::SUCCESS,
        Ok(Outcome::Unresolved) => ExitCode::from(EXIT_UNRESOLVED),
        Err(e) => {
            let code = exit_code(&e);
            tracing::error!(error = %format!("{e:#}"), "Command failed");
            printer.error(&e);
            ExitCode::from(code)
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<tenant_schema_sdk::InvalidTenantId>().is_some() {
        return EXIT_USAGE;
    }
    match err.downcast_ref::<SchemaError>() {
        Some(
            SchemaError::Config(_)
            | SchemaError::RegistryInconsistency(_)
            | SchemaError::InvalidIdentifier { .. },
        ) => EXIT_USAGE,
        _ => EXIT_UNRESOLVED,
    }
}

#[cfg_attr(not(feature = "pg"), allow(clippy::unused_async))]
async fn build(config: TenantSchemaConfig, mock: bool) -> Result<SchemaLifecycle> {
    if mock {
        tracing::info!("Using in-memory backend");
        let backend = Arc::new(InMemoryBackend::new(config.public_namespace.clone()));
        return Ok(SchemaLifecycle::from_config(config, backend)?);
    }

    #[cfg(feature = "pg")]
    {
        let dsn = config.redacted_dsn();
        SchemaLifecycle::connect(config)
            .await
            .with_context(|| format!("cannot open {dsn}"))
    }
    #[cfg(not(feature = "pg"))]
    {
        drop(config);
        Err(SchemaError::Config("built without PostgreSQL support; use --mock".to_owned()).into())
    }
}

fn parse_target(raw: &str) -> Result<Target> {
    Ok(raw.parse::<Target>()?)
}

async fn run(cli: &Cli, config: TenantSchemaConfig, printer: &Printer) -> Result<Outcome> {
    let lifecycle = build(config, cli.mock).await?;

    match &cli.command {
        Commands::Migrate { target } => match target {
            MigrateTarget::Public => {
                let outcome = lifecycle.migrate_shared().await?;
                printer.emit(&outcome, report::migration)?;
                Ok(Outcome::Ok)
            }
            MigrateTarget::Tenant { id } => {
                let tenant = TenantId::new(id.as_str())?;
                let outcome = lifecycle.provision(&tenant).await?;
                printer.emit(&outcome, report::provision)?;
                Ok(verdict(outcome.state == TenantState::Ready))
            }
            MigrateTarget::Setup => {
                let setup = lifecycle.setup().await?;
                printer.emit(&setup, report::setup)?;
                Ok(verdict(setup.validation.is_compliant()))
            }
        },
        Commands::Validate { target } if target == "all" => {
            let drift = lifecycle.validate_all().await?;
            printer.emit(&drift, report::drift)?;
            Ok(verdict(drift.is_healthy()))
        }
        Commands::Validate { target } => {
            let result = match parse_target(target)? {
                Target::Public => lifecycle.validate_shared().await?,
                Target::Tenant(tenant) => lifecycle.validate_tenant(&tenant).await?,
            };
            printer.emit(&result, report::validation)?;
            Ok(verdict(result.is_compliant()))
        }
        Commands::Heal { target } => {
            let healed = match parse_target(target)? {
                Target::Public => lifecycle.heal_shared().await?,
                Target::Tenant(tenant) => lifecycle.heal_tenant(&tenant).await?,
            };
            printer.emit(&healed, report::heal)?;
            Ok(verdict(healed.is_healed()))
        }
        Commands::Advise { target } => {
            let target = parse_target(target)?;
            let gaps = lifecycle.advise(&target).await?;
            let namespace = lifecycle.namespace_of(&target);
            printer.emit(&gaps, |g| report::gaps(&namespace, g))?;
            Ok(verdict(gaps.is_empty()))
        }
        Commands::Pending { target } => {
            let target = parse_target(target)?;
            let pending = lifecycle.pending(&target).await?;
            let namespace = lifecycle.namespace_of(&target);
            printer.emit(&pending, |p| report::pending(&namespace, p))?;
            Ok(Outcome::Ok)
        }
        Commands::Check => {
            let check = lifecycle.check().await?;
            printer.emit(&check, report::check)?;
            Ok(Outcome::Ok)
        }
    }
}

fn verdict(ok: bool) -> Outcome {
    if ok { Outcome::Ok } else { Outcome::Unresolved }
}
