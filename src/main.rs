use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;
use zmigrate::{
    Address, MigrationCoordinator, SshConnector, TransferEngine, ZmigrateConfig, logger,
};

#[derive(Parser)]
#[command(name = "zmigrate")]
#[command(about = "Incremental ZFS replication and live VM relocation between hosts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate a dataset to another host
    Transfer {
        /// [HOST:]DATASET
        source: String,
        /// HOST[:PORT][(DATA_HOST)][:DATASET], or a bare dataset for a local copy
        destination: String,
        #[command(flatten)]
        flags: RunFlags,
    },
    /// Replicate the dataset holding a VM's primary disk
    TransferVm {
        /// [HOST:]DOMAIN
        source: String,
        /// HOST[:PORT][(DATA_HOST)][:DATASET]
        destination: String,
        #[command(flatten)]
        flags: RunFlags,
    },
    /// Live-migrate a VM together with its storage
    Migrate {
        /// [HOST:]DOMAIN
        source: String,
        /// HOST[:PORT][(DATA_HOST)][:DATASET]
        destination: String,
        #[command(flatten)]
        flags: RunFlags,
    },
}

#[derive(Args, Debug, Clone, Copy)]
struct RunFlags {
    /// Perform the operation; without this only the plan is shown
    #[arg(short = 'x', long)]
    execute: bool,
    /// Overwrite a destination that shares no snapshot with the source
    #[arg(short, long)]
    force: bool,
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<ZmigrateConfig> {
    let Some(path) = path.or_else(ZmigrateConfig::default_path) else {
        return Ok(ZmigrateConfig::default());
    };
    if path.exists() {
        ZmigrateConfig::from_file(&path)
            .with_context(|| format!("failed to load {}", path.display()))
    } else {
        logger::warn!("Config not found at {}, using defaults", path.display());
        Ok(ZmigrateConfig::default())
    }
}

/// A bare destination without `:` is a local dataset name.
fn parse_destination(raw: &str) -> anyhow::Result<Address> {
    if raw.contains([':', '(']) {
        Ok(Address::parse_destination(raw)?)
    } else {
        Ok(Address::parse_source(raw)?)
    }
}

fn render<T: Serialize + Display>(report: &T, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = load_config(cli.config)?;
    let connector = SshConnector::new(config.ssh.clone());

    match cli.command {
        Commands::Transfer {
            source,
            destination,
            flags,
        } => {
            let source = Address::parse_source(&source)?;
            let destination = parse_destination(&destination)?;
            let engine = TransferEngine::new(&connector, &config);
            let report = engine
                .transfer(&source, &destination, flags.execute, flags.force)
                .await?;
            render(&report, cli.json)?;
            Ok(report.success())
        }
        Commands::TransferVm {
            source,
            destination,
            flags,
        } => {
            let source = Address::parse_source(&source)?;
            let destination = parse_destination(&destination)?;
            let engine = TransferEngine::new(&connector, &config);
            let report = engine
                .transfer_workload(&source, &destination, flags.execute, flags.force)
                .await?;
            render(&report, cli.json)?;
            Ok(report.success())
        }
        Commands::Migrate {
            source,
            destination,
            flags,
        } => {
            let source = Address::parse_source(&source)?;
            let destination = Address::parse_destination(&destination)?;
            let coordinator = MigrationCoordinator::new(&connector, &config);
            let job = coordinator
                .migrate(&source, &destination, flags.execute, flags.force)
                .await?;
            render(&job, cli.json)?;
            Ok(job.success())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "zmigrate=debug");
        }
    }
    logger::init_logger();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            logger::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
