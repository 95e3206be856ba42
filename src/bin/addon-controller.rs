//! addon-controller CLI: run the controller or inspect the object store.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use addon_controller::config::Config;
use addon_controller::controllers;
use addon_controller::db::Db;
use addon_controller::engine::{EngineConfig, Manager, ManagerConfig};
use addon_controller::health::HealthSignal;
use addon_controller::leader::LeaderElectionConfig;
use addon_controller::model::ObjectIdentity;
use addon_controller::server;
use addon_controller::telemetry::metrics::ControllerMetrics;
use addon_controller::telemetry::{TelemetryConfig, init_telemetry};
use addon_controller::watch::WatchConfig;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "addon-controller", about = "Keeps cluster objects in their desired state")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller
    Serve(ServeArgs),
    /// Object store operations
    Object {
        #[command(subcommand)]
        action: ObjectAction,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Address the /metrics endpoint binds to
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: SocketAddr,
    /// Address the /healthz and /readyz endpoints bind to
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_probe_bind_address: SocketAddr,
    /// Enable leader election so only one replica reconciles
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    leader_elect: bool,
    /// Lease name shared by all replicas
    #[arg(long, default_value = "addon-controller.yourorg.io")]
    lease_name: String,
    /// Worker tasks
    #[arg(long, default_value_t = 5)]
    max_concurrent_reconciles: usize,
    /// Seconds between full resyncs
    #[arg(long, default_value_t = 600)]
    resync_period_secs: u64,
    /// Seconds in-flight reconciles may run after shutdown starts. With leader
    /// election the lease timings cap it further
    #[arg(long, default_value_t = 30)]
    shutdown_grace_period_secs: u64,
}

#[derive(Subcommand)]
enum ObjectAction {
    /// Create or overwrite an object
    Apply {
        kind: String,
        name: String,
        #[arg(long, default_value = "")]
        namespace: String,
        /// Label as key=value, repeatable
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
        /// JSON spec
        #[arg(long)]
        spec: Option<String>,
    },
    /// List objects
    List {
        /// Filter by kind
        #[arg(long)]
        kind: Option<String>,
    },
    /// Show one object
    Show {
        kind: String,
        name: String,
        #[arg(long, default_value = "")]
        namespace: String,
    },
    /// Delete an object
    Delete {
        kind: String,
        name: String,
        #[arg(long, default_value = "")]
        namespace: String,
    },
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => cmd_serve(args).await,
        Command::Object { action } => {
            let config = Config::from_env()?;
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;

            match action {
                ObjectAction::Apply {
                    kind,
                    name,
                    namespace,
                    labels,
                    spec,
                } => cmd_object_apply(&db, ObjectIdentity::new(kind, namespace, name), labels, spec).await,
                ObjectAction::List { kind } => cmd_object_list(&db, kind).await,
                ObjectAction::Show {
                    kind,
                    name,
                    namespace,
                } => cmd_object_show(&db, ObjectIdentity::new(kind, namespace, name)).await,
                ObjectAction::Delete {
                    kind,
                    name,
                    namespace,
                } => {
                    let id = ObjectIdentity::new(kind, namespace, name);
                    db.delete_object(&id).await?;
                    println!("Deleted: {id}");
                    Ok(())
                }
            }
        }
    }
}

async fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let telemetry = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "addon-controller".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;
    db.health_check().await?;

    let probe_listener = server::bind(args.health_probe_bind_address).await?;
    let metrics_listener = server::bind(args.metrics_bind_address).await?;

    let health = Arc::new(HealthSignal::with_heartbeat(Duration::from_secs(30)));
    let metrics = Arc::new(ControllerMetrics::new());

    let leader_election = args
        .leader_elect
        .then(|| LeaderElectionConfig::new(args.lease_name.clone(), config.identity.clone()));
    let manager_config = ManagerConfig {
        engine: EngineConfig {
            workers: args.max_concurrent_reconciles,
            ..EngineConfig::default()
        },
        watch: WatchConfig {
            resync_period: Duration::from_secs(args.resync_period_secs),
            ..WatchConfig::default()
        },
        leader_election,
        shutdown_grace_period: Duration::from_secs(args.shutdown_grace_period_secs),
        ..ManagerConfig::default()
    };

    let mut builder = Manager::builder(db.clone())
        .health(Arc::clone(&health))
        .metrics(Arc::clone(&metrics))
        .lease_store(db.clone())
        .config(manager_config);
    for reconciler in controllers::from_config(&config) {
        builder = builder.reconciler(reconciler)?;
    }
    let manager = builder.build()?;

    info!(
        identity = %config.identity,
        leader_elect = args.leader_elect,
        workers = args.max_concurrent_reconciles,
        "starting addon-controller"
    );

    let cancel = CancellationToken::new();
    let probes = tokio::spawn(server::serve(
        probe_listener,
        server::probe_router(Arc::clone(&health)),
        cancel.clone(),
    ));
    let metrics_server = tokio::spawn(server::serve(
        metrics_listener,
        server::metrics_router(Arc::clone(&metrics)),
        cancel.clone(),
    ));

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    manager.run(cancel.clone()).await;
    cancel.cancel();

    for (name, task) in [("probe", probes), ("metrics", metrics_server)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(server = name, error = %e, "http server failed"),
            Err(e) => error!(server = name, error = %e, "http server task failed"),
        }
    }

    info!("addon-controller stopped");
    telemetry.force_flush();
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn cmd_object_apply(
    db: &Db,
    id: ObjectIdentity,
    labels: Vec<(String, String)>,
    spec: Option<String>,
) -> anyhow::Result<()> {
    let spec: serde_json::Value = match spec {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::Value::Null,
    };
    let labels: BTreeMap<String, String> = labels.into_iter().collect();

    let snapshot = db.apply_object(&id, &labels, &spec).await?;
    println!("Applied: {} (version {})", snapshot.id, snapshot.resource_version);
    Ok(())
}

async fn cmd_object_list(db: &Db, kind: Option<String>) -> anyhow::Result<()> {
    let objects = db.list_objects(kind.as_deref()).await?;

    if objects.is_empty() {
        println!("No objects found.");
        return Ok(());
    }

    println!(
        "{:<12}  {:<16}  {:<30}  {:<8}  LABELS",
        "KIND", "NAMESPACE", "NAME", "VERSION"
    );
    println!("{}", "-".repeat(100));

    for object in &objects {
        let labels = object
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let namespace = if object.id.namespace.is_empty() {
            "-"
        } else {
            object.id.namespace.as_str()
        };
        println!(
            "{:<12}  {:<16}  {:<30}  {:<8}  {}",
            object.id.kind, namespace, object.id.name, object.resource_version, labels
        );
    }

    println!("\n{} object(s)", objects.len());
    Ok(())
}

async fn cmd_object_show(db: &Db, id: ObjectIdentity) -> anyhow::Result<()> {
    let object = db.get_object(&id).await?;

    println!("Kind:       {}", object.id.kind);
    if !object.id.namespace.is_empty() {
        println!("Namespace:  {}", object.id.namespace);
    }
    println!("Name:       {}", object.id.name);
    println!("Version:    {}", object.resource_version);
    println!("Labels:");
    for (key, value) in &object.labels {
        println!("  {key}={value}");
    }
    println!("Spec:       {}", serde_json::to_string_pretty(&object.spec)?);
    Ok(())
}
