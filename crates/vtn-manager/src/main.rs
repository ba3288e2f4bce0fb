//! vtnd - Virtual Tenant Network daemon
//!
//! Loads the configuration, builds the in-memory topology and the VTN
//! manager, restores the configured tenants and reports the derived state
//! of every virtual node.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vtn_manager::packet::EtherFrame;
use vtn_manager::topology::FlowSpec;
use vtn_manager::{
    Collaborators, ConditionTable, ForwardingSink, NodePath, PhysicalPort, StaticTopology, VtnConfig, VtnManager,
};

/// Virtual Tenant Network daemon
#[derive(Parser, Debug)]
#[command(name = "vtnd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

/// Sink that only logs what would be sent to the switches.
struct LoggingSink;

impl ForwardingSink for LoggingSink {
    fn transmit(&self, port: &PhysicalPort, frame: &EtherFrame) {
        info!("transmit {} -> {} on {} vlan {}", frame.src, frame.dst, port, frame.vlan);
    }

    fn install_flow(&self, flow: &FlowSpec) {
        info!(
            "install flow {}: {} -> {} from {} to {} ({} links)",
            flow.owner,
            flow.src,
            flow.dst,
            flow.ingress,
            flow.egress,
            flow.route.links.len()
        );
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn run(args: &Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => VtnConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => VtnConfig::default(),
    };

    let topology = Arc::new(match &config.topology {
        Some(topology) => StaticTopology::from_config(topology).context("Invalid topology")?,
        None => StaticTopology::new(),
    });
    let conditions =
        Arc::new(ConditionTable::from_conditions(config.conditions.clone()).context("Invalid flow condition")?);

    let manager = VtnManager::new(
        &config,
        Collaborators {
            topology: topology.clone(),
            routes: topology,
            sink: Arc::new(LoggingSink),
            conditions,
        },
    )
    .context("Failed to create VTN manager")?;

    for tenant in &config.tenants {
        manager
            .load_tenant(tenant)
            .with_context(|| format!("Failed to load VTN {}", tenant.name))?;
    }
    manager.resume();

    for tenant in manager.tenant_names() {
        for name in manager.node_names(&tenant)? {
            let path = NodePath::new(tenant.clone(), name);
            info!("{}: {} {}", path, manager.node_kind(&path)?, manager.node_state(&path)?);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("--- Starting vtnd ---");
    match run(&args) {
        Ok(()) => {
            info!("vtnd initialization complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("vtnd failed: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
