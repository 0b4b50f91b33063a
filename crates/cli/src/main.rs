//! `rusty-automation-tool` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    — start the API server and trigger dispatcher.
//! - `run`      — execute a workflow file synchronously against an
//!                in-memory manager, for local testing.
//! - `migrate`  — run pending database migrations.
//! - `validate` — validate a workflow JSON file.

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use engine::manager::{Manager, ManagerConfig};
use engine::registry::{MapperRegistry, NodeRegistry};
use engine::scheduler::PredicateRegistry;
use engine::Workflow;
use nodes::mock::MockNode;
use tracing::info;

mod app_config;
use app_config::AppConfig;

#[derive(Parser)]
#[command(
    name = "rusty-automation-tool",
    about = "High-performance workflow automation engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    ///
    /// Settings are layered: `config/default.toml` < `RAT_`-prefixed
    /// environment variables < these flags. `--bind`/`--database-url` only
    /// override their config-layer value when actually passed.
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Execute a workflow file synchronously against an in-memory manager.
    ///
    /// Every node `node_type` referenced by the file is bound to a
    /// passthrough stub (no side effects) so the DAG's shape — ordering,
    /// fan-out, retries, compensation — can be exercised without a real
    /// node registry, matching how `nodes::mock::MockNode` already stands
    /// in for node implementations in the engine's own tests.
    Run {
        /// Path to the workflow JSON file.
        path: std::path::PathBuf,
        /// JSON object merged over the workflow's initial state.
        #[arg(long)]
        state: Option<String>,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: std::path::PathBuf,
    },
}

fn load_workflow(path: &std::path::Path) -> Workflow {
    let content = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("cannot read file {}: {e}", path.display()));
    serde_json::from_str(&content).unwrap_or_else(|e| panic!("invalid JSON: {e}"))
}

/// Builds a `NodeRegistry` with one passthrough stub per distinct
/// `node_type` the workflow references.
fn stub_registry(wf: &Workflow) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    for spec in wf.nodes.values() {
        if let engine::NodeKind::Function { node_type } = &spec.kind {
            registry
                .entry(node_type.clone())
                .or_insert_with(|| Arc::new(MockNode::returning(node_type.clone(), serde_json::json!({}))));
        }
    }
    registry
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { bind, database_url } => {
            let mut app_config = AppConfig::load().unwrap_or_else(|e| {
                tracing::warn!("failed to load config/default.toml, using built-in defaults: {e}");
                AppConfig::default()
            });
            if let Some(bind) = bind {
                app_config.server.bind = bind;
            }
            if let Some(database_url) = database_url {
                app_config.server.database_url = database_url;
            }

            info!("Starting API server on {}", app_config.server.bind);
            let pool = db::pool::create_pool(&app_config.server.database_url, 10)
                .await
                .expect("failed to connect to database");

            let manager = Manager::new(app_config.manager_config(), NodeRegistry::new(), MapperRegistry::new(), PredicateRegistry::new());
            manager.start();

            let triggers = Arc::new(triggers::TriggerDispatcher::new(None));
            let cron_handle = triggers.spawn_cron_poll_loop(manager.clone() as Arc<dyn triggers::FireSink>);

            api::serve(&app_config.server.bind, pool, manager.clone(), triggers.clone()).await.unwrap();

            triggers.stop();
            let _ = cron_handle.await;
            manager.stop().await;
        }
        Command::Run { path, state } => {
            let wf = load_workflow(&path);
            let state_patch = state.map(|s| serde_json::from_str(&s).unwrap_or_else(|e| panic!("invalid --state JSON: {e}")));

            let manager = Manager::new(ManagerConfig::default(), stub_registry(&wf), HashMap::new(), PredicateRegistry::new());
            manager.start();

            match manager.execute(wf, state_patch).await {
                Ok(run) => {
                    println!("{}", serde_json::to_string_pretty(&run).unwrap());
                    manager.stop().await;
                    if run.status != engine::RunStatus::Completed {
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    manager.stop().await;
                    eprintln!("run failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Migrate { database_url } => {
            info!("Running migrations against {database_url}");
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .expect("failed to connect to database");
            db::pool::run_migrations(&pool)
                .await
                .expect("migration failed");
            info!("Migrations applied successfully");
        }
        Command::Validate { path } => {
            let workflow = load_workflow(&path);

            match engine::scheduler::validate_workflow(&workflow) {
                Ok(()) => {
                    let levels = engine::scheduler::get_execution_levels(&workflow).unwrap_or_default();
                    println!("workflow is valid. execution levels: {levels:?}");
                }
                Err(e) => {
                    eprintln!("validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
