use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use quark_bus::{BusConfig, EventBus, MemoryBroker, StreamConfig};
use quark_core::{ServiceRecord, ServiceRegistration, ServiceStatus, ServiceType, SystemClock};
use quark_db::SqliteStore;
use quark_registry::{HealthMonitor, HttpProber, MonitorConfig, Registry, RegistryConfig};

#[derive(Parser)]
#[command(name = "quark")]
#[command(about = "Quark Hub local administrative CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "DATABASE_URL", default_value = "quark.db")]
    db: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Service management
    Service {
        #[command(subcommand)]
        sub: ServiceCommands,
    },
    /// Module inspection
    Module {
        #[command(subcommand)]
        sub: ModuleCommands,
    },
    /// Show registry counts
    Stats,
    /// Run a health check against one service now
    Check { id: String },
    /// Remove services whose last heartbeat is too old
    Sweep {
        #[arg(long, default_value_t = 300)]
        stale_secs: u64,
    },
}

#[derive(Subcommand)]
enum ServiceCommands {
    /// List registered services
    List {
        #[arg(long = "type")]
        kind: Option<ServiceType>,
    },
    /// Print one service as JSON
    Show { id: String },
    /// Register or update a service
    Register {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long = "type")]
        kind: ServiceType,
        #[arg(long, default_value = "1.0.0")]
        version: String,
        #[arg(long)]
        endpoint: Option<String>,
        /// Extra metadata as key=value, repeatable
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },
    /// Remove a service and its health record
    Unregister { id: String },
    /// Record a heartbeat for a service
    Heartbeat { id: String },
    /// Set the operational status (active, inactive, error)
    Status { id: String, status: ServiceStatus },
    /// Search by id, name or type
    Search { pattern: String },
}

#[derive(Subcommand)]
enum ModuleCommands {
    /// List registered modules
    List,
    /// Print one module as JSON
    Show { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let store = Arc::new(SqliteStore::new(&cli.db)?);
    // Events go to an in-process broker; nothing outside this command sees them.
    let bus = Arc::new(EventBus::new(
        Arc::new(MemoryBroker::new(StreamConfig::default())),
        BusConfig::default(),
    ));
    bus.connect().await?;
    let registry = Arc::new(Registry::new(store, bus, Arc::new(SystemClock), RegistryConfig::default()));

    match cli.command {
        Commands::Service { sub } => match sub {
            ServiceCommands::List { kind } => {
                let services = match kind {
                    Some(kind) => registry.services_by_type(kind)?,
                    None => registry.all_services()?,
                };
                print_services(&services);
            }
            ServiceCommands::Show { id } => match registry.get_service(&id)? {
                Some(service) => println!("{}", serde_json::to_string_pretty(&service)?),
                None => return Err(format!("service '{}' not found", id).into()),
            },
            ServiceCommands::Register { id, name, kind, version, endpoint, metadata } => {
                let mut registration = ServiceRegistration::new(id, name, kind).with_version(version);
                registration.endpoint = endpoint;
                for (key, value) in metadata {
                    registration.add_metadata(key, value);
                }
                let service = registry.register_service(registration).await?;
                println!("Service registered: {} ({})", service.id, service.kind);
            }
            ServiceCommands::Unregister { id } => {
                if registry.unregister_service(&id).await? {
                    println!("Service unregistered: {}", id);
                } else {
                    println!("No service with id {}", id);
                }
            }
            ServiceCommands::Heartbeat { id } => {
                if registry.heartbeat(&id)? {
                    println!("Heartbeat recorded: {}", id);
                } else {
                    println!("No service with id {}", id);
                }
            }
            ServiceCommands::Status { id, status } => {
                if registry.update_status(&id, status)? {
                    println!("Status of {} set to {:?}", id, status);
                } else {
                    println!("No service with id {}", id);
                }
            }
            ServiceCommands::Search { pattern } => {
                print_services(&registry.find_by_pattern(&pattern)?);
            }
        },
        Commands::Module { sub } => match sub {
            ModuleCommands::List => {
                let modules = registry.all_modules()?;
                println!("Registered Modules:");
                println!("{:<24} {:<24} {:<10} {:<8}", "ID", "Name", "Version", "Type");
                println!("{}", "-".repeat(70));
                for module in modules {
                    println!(
                        "{:<24} {:<24} {:<10} {:<8}",
                        module.id,
                        module.name,
                        module.version,
                        format!("{:?}", module.kind)
                    );
                }
            }
            ModuleCommands::Show { id } => match registry.get_module(&id)? {
                Some(module) => println!("{}", serde_json::to_string_pretty(&module)?),
                None => return Err(format!("module '{}' not found", id).into()),
            },
        },
        Commands::Stats => {
            let stats = registry.service_stats()?;
            println!("Quark Hub Registry Overview");
            println!("{}", "=".repeat(30));
            println!("Total Services: {}", stats.total);
            println!("Active:         {}", stats.active);
            println!("Inactive:       {}", stats.inactive);
            println!("Error:          {}", stats.error);
            println!("Healthy:        {}", stats.healthy);
            println!("Unhealthy:      {}", stats.unhealthy);
            println!("Unknown:        {}", stats.unknown);
            for (kind, count) in &stats.by_type {
                println!("  {:<14}{}", kind, count);
            }
            println!("Total Modules:  {}", registry.all_modules()?.len());
        }
        Commands::Check { id } => {
            let config = MonitorConfig::default();
            let prober = Arc::new(HttpProber::new(config.probe_timeout, config.probe_path.clone())?);
            let monitor = HealthMonitor::new(registry.clone(), prober, config);
            match monitor.check_service(&id).await? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => return Err(format!("service '{}' not found", id).into()),
            }
        }
        Commands::Sweep { stale_secs } => {
            let config = MonitorConfig {
                stale_timeout: Duration::from_secs(stale_secs),
                ..MonitorConfig::default()
            };
            let prober = Arc::new(HttpProber::new(config.probe_timeout, config.probe_path.clone())?);
            let monitor = HealthMonitor::new(registry.clone(), prober, config);
            let report = monitor.run_stale_sweep().await?;
            println!("Removed {} stale service(s)", report.removed.len());
            for id in &report.removed {
                println!("  {}", id);
            }
            if report.failed > 0 {
                println!("{} removal(s) failed, see logs", report.failed);
            }
        }
    }

    Ok(())
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

fn print_services(services: &[ServiceRecord]) {
    println!("Registered Services:");
    println!("{:<24} {:<20} {:<13} {:<9} {:<10}", "ID", "Name", "Type", "Status", "Health");
    println!("{}", "-".repeat(80));
    for svc in services {
        println!(
            "{:<24} {:<20} {:<13} {:<9} {:<10}",
            svc.id,
            svc.name,
            svc.kind.as_str(),
            format!("{:?}", svc.status),
            svc.health.to_string()
        );
    }
}
