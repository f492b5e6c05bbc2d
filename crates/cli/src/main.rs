mod config;
mod error;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use acquire::{Catalog, HttpCatalog};
use runtime::{AcquireOptions, Daemon, Settings, Supervisor, SupervisorBuilder};
use storage::Journal;
use variety::{CapabilityDescriptor, Priority};

use config::Config;
use error::{Error, Result};

const CONFIG_FILE: &str = "quartermaster.toml";
const APP_NAME: &str = "quartermaster";

#[derive(Parser)]
#[command(name = "quartermaster")]
#[command(about = "An autonomous capability-acquisition supervisor", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring loop until interrupted
    Run,
    /// Run one acquisition for an explicit capability gap
    Acquire {
        /// Descriptor kind, e.g. "search"
        #[arg(long)]
        kind: String,
        /// Search terms (repeatable)
        #[arg(long = "term")]
        terms: Vec<String>,
        /// Descriptor priority
        #[arg(long, default_value = "high")]
        priority: String,
        /// Re-run even if the capability is already bound
        #[arg(long)]
        force: bool,
    },
    /// Show the composed status report
    Status,
    /// List live tool servers
    Servers,
    /// List capability bindings
    Capabilities,
    /// Show recent journaled events
    History {
        /// Filter by event kind (e.g. gap_report, acquisition_finished)
        #[arg(short, long)]
        kind: Option<String>,
        /// Show at most N entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(config).await,
        Commands::Acquire {
            kind,
            terms,
            priority,
            force,
        } => cmd_acquire(config, kind, terms, &priority, force).await,
        Commands::Status => cmd_status(config).await,
        Commands::Servers => cmd_servers(config).await,
        Commands::Capabilities => cmd_capabilities(config).await,
        Commands::History { kind, limit } => cmd_history(config, kind.as_deref(), limit),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let default = PathBuf::from(CONFIG_FILE);
            if default.exists() {
                Config::load(&default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn build(config: &Config) -> Result<(Arc<Supervisor>, Daemon)> {
    let settings = Settings::from_env();

    let mut catalogs: Vec<Arc<dyn Catalog>> = Vec::new();
    for catalog in config.catalogs() {
        let client = HttpCatalog::new(&catalog.name, &catalog.url, settings.http_timeout)?;
        catalogs.push(Arc::new(client));
    }

    let (supervisor, daemon) = SupervisorBuilder::new(settings)
        .catalogs(catalogs)
        .environment(config.environment.clone())
        .variety(config.variety.clone())
        .baseline(config.baseline)
        .build();
    Ok((supervisor, daemon))
}

fn journal_path(config: &Config) -> PathBuf {
    config.journal.clone().unwrap_or_else(|| {
        dirs::data_dir()
            .map(|p| p.join(APP_NAME))
            .unwrap_or_else(|| PathBuf::from(format!(".{APP_NAME}")))
            .join("journal.db")
    })
}

async fn cmd_run(config: Config) -> Result<()> {
    println!("quartermaster v{}", env!("CARGO_PKG_VERSION"));

    let (supervisor, daemon) = build(&config)?;

    let journal_path = journal_path(&config);
    if let Some(parent) = journal_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    supervisor.attach_journal(Journal::open(&journal_path)?);

    supervisor
        .start_configured(config.server_configs(supervisor.settings()))
        .await;

    println!("  Catalogs: {}", config.catalogs().len());
    println!("  Servers:  {}", supervisor.list_servers().len());
    println!("  Journal:  {}", journal_path.display());
    println!("Press ctrl-c to stop.");

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    daemon.run(shutdown).await;
    println!("Stopped.");
    Ok(())
}

async fn cmd_acquire(
    config: Config,
    kind: String,
    terms: Vec<String>,
    priority: &str,
    force: bool,
) -> Result<()> {
    let priority = parse_priority(priority)?;
    let descriptor = CapabilityDescriptor::new(kind, priority, terms);

    let (supervisor, _daemon) = build(&config)?;
    supervisor
        .start_configured(config.server_configs(supervisor.settings()))
        .await;

    let record = supervisor
        .acquire(
            vec![descriptor],
            AcquireOptions {
                force,
                ..AcquireOptions::default()
            },
        )
        .await;

    println!("{}", serde_json::to_string_pretty(&record).unwrap_or_default());
    supervisor.manager().stop_all().await;
    Ok(())
}

async fn cmd_status(config: Config) -> Result<()> {
    let (supervisor, _daemon) = build(&config)?;
    supervisor
        .start_configured(config.server_configs(supervisor.settings()))
        .await;

    let status = supervisor.status();
    println!("System variety:        {:.1}", status.variety.system_variety);
    println!(
        "Environmental variety: {:.1}",
        status.variety.environmental_variety
    );
    println!("Ratio:                 {:.2}", status.variety.ratio);
    println!("Absolute gap:          {:.1}", status.variety.absolute_gap);
    if !status.variety.critical_areas.is_empty() {
        let areas: Vec<String> = status
            .variety
            .critical_areas
            .iter()
            .map(|a| a.to_string())
            .collect();
        println!("Critical areas:        {}", areas.join(", "));
    }
    for recommendation in &status.variety.recommendations {
        println!("  - {recommendation}");
    }
    println!();
    println!(
        "Servers: {}   Capabilities: {}   In-flight: {}   Advisory: {}",
        status.servers.len(),
        status.capabilities.len(),
        status.in_flight.len(),
        if status.advisory { "raised" } else { "clear" },
    );

    supervisor.manager().stop_all().await;
    Ok(())
}

async fn cmd_servers(config: Config) -> Result<()> {
    let (supervisor, _daemon) = build(&config)?;
    supervisor
        .start_configured(config.server_configs(supervisor.settings()))
        .await;

    let servers = supervisor.list_servers();
    if servers.is_empty() {
        println!("No servers running.");
    } else {
        println!("{:<36}  {:<16}  {:<10}  TOOLS", "SERVER ID", "NAME", "STATE");
        println!("{}", "─".repeat(80));
        for server in &servers {
            println!(
                "{:<36}  {:<16}  {:<10}  {}",
                server.id,
                server.name,
                server.state,
                server.tools.join(", "),
            );
        }
    }

    supervisor.manager().stop_all().await;
    Ok(())
}

async fn cmd_capabilities(config: Config) -> Result<()> {
    let (supervisor, _daemon) = build(&config)?;
    supervisor
        .start_configured(config.server_configs(supervisor.settings()))
        .await;

    let bindings = supervisor.list_capabilities();
    if bindings.is_empty() {
        println!("No capabilities bound.");
    } else {
        println!("{:<28}  {:<36}  TOOL", "CAPABILITY", "SERVER");
        println!("{}", "─".repeat(80));
        for binding in &bindings {
            println!(
                "{:<28}  {:<36}  {}",
                binding.capability, binding.server_id, binding.tool,
            );
        }
    }

    supervisor.manager().stop_all().await;
    Ok(())
}

fn cmd_history(config: Config, kind: Option<&str>, limit: usize) -> Result<()> {
    let path = journal_path(&config);
    if !path.exists() {
        return Err(Error::JournalNotFound { path });
    }

    let journal = Journal::open(&path)?;
    let entries = journal.recent(limit, kind)?;
    if entries.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    for entry in entries {
        let time = Local
            .from_utc_datetime(&entry.timestamp.naive_utc())
            .format("%Y-%m-%d %H:%M:%S");
        let data = entry.data.to_string();
        let display = if data.chars().count() > 120 {
            let truncated: String = data.chars().take(120).collect();
            format!("{truncated}…")
        } else {
            data
        };
        println!("[{time}] {}: {display}", entry.kind);
    }
    Ok(())
}

fn parse_priority(raw: &str) -> Result<Priority> {
    match raw.to_lowercase().as_str() {
        "high" => Ok(Priority::High),
        "medium" => Ok(Priority::Medium),
        "low" => Ok(Priority::Low),
        _ => Err(Error::BadPriority(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!(parse_priority("High").unwrap(), Priority::High);
        assert_eq!(parse_priority("medium").unwrap(), Priority::Medium);
        assert!(parse_priority("urgent").is_err());
    }
}
