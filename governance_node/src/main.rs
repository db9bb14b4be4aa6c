use governance_core::config::GovernanceConfig;
use governance_core::log::{init_logging, log_startup};
use governance_core::metrics::install_prometheus_exporter;
use governance_core::store::CoordinationStore;
use governance_core::{
    FaultToleranceManager, GovernanceError, GovernanceMetrics, MemoryStore, ResourceManager,
    ShutdownCoordinator,
};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

const STORE_EXPIRY_SWEEP: Duration = Duration::from_secs(1);
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

struct NodeArgs {
    config_path: Option<String>,
    node_id: Option<String>,
    run_for_leader: bool,
    validate_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();

    let mut node_args = NodeArgs {
        config_path: None,
        node_id: None,
        run_for_leader: false,
        validate_only: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if i + 1 < args.len() {
                    node_args.config_path = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path");
                    return Err("Missing config path".into());
                }
            }
            "--node-id" => {
                if i + 1 < args.len() {
                    node_args.node_id = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: --node-id requires a value");
                    return Err("Missing node-id".into());
                }
            }
            "--leader" => {
                node_args.run_for_leader = true;
            }
            "--validate" => {
                node_args.validate_only = true;
            }
            "--help" => {
                print_usage();
                return Ok(());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                return Err("Unknown argument".into());
            }
        }
        i += 1;
    }

    let config = load_config(&node_args)?;
    if node_args.validate_only {
        println!("Configuration is valid for node {}", config.node.node_id);
        return Ok(());
    }

    run_node(config).await
}

fn print_usage() {
    println!("governance_node - resource governance and coordination node");
    println!();
    println!("Usage:");
    println!("  governance_node [options]");
    println!();
    println!("Options:");
    println!("  --config <path>                    # Configuration file (.toml, .yaml or .yml)");
    println!("  --node-id <id>                     # Node identifier (overrides config)");
    println!("  --leader                           # Run for leadership on startup");
    println!("  --validate                         # Validate configuration and exit");
    println!("  --help                             # Show this message");
    println!();
    println!("Environment overrides:");
    println!("  GOVERNANCE_NODE_ID, GOVERNANCE_MAX_SOCKETS, GOVERNANCE_LOG_LEVEL, ...");
}

fn load_config(args: &NodeArgs) -> Result<GovernanceConfig, Box<dyn Error>> {
    let mut config = match &args.config_path {
        Some(path) => GovernanceConfig::load(path)?,
        None => GovernanceConfig::default(),
    };

    config.apply_env_overrides()?;
    if let Some(node_id) = &args.node_id {
        config.node.node_id = node_id.clone();
    }
    if args.run_for_leader {
        config.node.run_for_leader = true;
    }

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        return Err(GovernanceError::Config(errors.join("; ")).into());
    }
    Ok(config)
}

async fn run_node(config: GovernanceConfig) -> Result<(), Box<dyn Error>> {
    init_logging(&config.logging)?;
    log_startup(&config);

    if install_prometheus_exporter(&config.metrics)? {
        println!(
            "📊 Metrics exported on {}:{}",
            config.metrics.bind_address, config.metrics.port
        );
    }

    let metrics = Arc::new(GovernanceMetrics::new());

    let resources = ResourceManager::builder(config.resources.clone())
        .with_metrics(Arc::clone(&metrics))
        .build();
    resources.start_reclaimer();

    let store: Arc<dyn CoordinationStore> =
        Arc::new(MemoryStore::new().with_expiry_sweep(STORE_EXPIRY_SWEEP));
    let fault_tolerance =
        FaultToleranceManager::from_config(&config, Some(store)).with_metrics(Arc::clone(&metrics));
    fault_tolerance.register_node(config.node.node_id.clone()).await;

    let node_id = config.node.node_id.clone();
    println!("🚀 Node {} started", node_id);

    if config.node.run_for_leader {
        let election = fault_tolerance
            .elect_leader(&config.node.election_key, &node_id)
            .await?;
        if election.is_leader() {
            println!("👑 Node {} is leader for {}", node_id, config.node.election_key);
        } else {
            let holder = election.current_leader().await?.unwrap_or_else(|| "<none>".to_string());
            println!("Node {} is following leader {}", node_id, holder);
        }
    }

    let shutdown = ShutdownCoordinator::from_config(&config);
    shutdown.listen_for_signals();

    let mut status_handle = shutdown.subscribe();
    let status_resources = &resources;
    let status = async {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let usage = status_resources.publish_usage();
                    tracing::info!(
                        total = usage.total_resources,
                        memory_mb = usage.memory_usage_mb,
                        memory_limit_mb = usage.memory_limit_mb,
                        cleanup_failures = usage.cleanup_failures,
                        "Resource usage"
                    );
                }
                _ = status_handle.wait_for_shutdown() => break,
            }
        }
    };

    let (signal, ()) = tokio::join!(shutdown.wait_for_shutdown(), status);

    let completed = shutdown
        .run_shutdown(signal, async {
            fault_tolerance.shutdown().await;
            resources.shutdown().await;
        })
        .await;

    let snapshot = metrics.snapshot();
    println!(
        "✅ Node {} stopped (clean={}, resources released={}, cleanup failures={})",
        node_id, completed, snapshot.resources_released, snapshot.cleanup_failures
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(node_id: Option<&str>) -> NodeArgs {
        NodeArgs {
            config_path: None,
            node_id: node_id.map(str::to_string),
            run_for_leader: true,
            validate_only: true,
        }
    }

    #[test]
    fn test_load_config_applies_flags() {
        let config = load_config(&args(Some("edge-7"))).unwrap();
        assert_eq!(config.node.node_id, "edge-7");
        assert!(config.node.run_for_leader);
    }

    #[test]
    fn test_invalid_config_reported_as_config_error() {
        let err = load_config(&args(Some(""))).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GovernanceError>(),
            Some(GovernanceError::Config(_))
        ));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let mut node_args = args(None);
        node_args.config_path = Some("/definitely/not/here.toml".to_string());
        assert!(load_config(&node_args).is_err());
    }
}
