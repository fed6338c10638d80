//! Gantry - build, publish, and roll out one deployment unit

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gantry::build::DockerCli;
use gantry::cluster::{KubeClusterApi, Reconciler, SystemClock};
use gantry::config;
use gantry::notify::{Notifier, ReqwestTransport};
use gantry::{FlowKind, Pipeline, StepKind};

/// Gantry - flow-driven deploy pipeline for containerized services
#[derive(Parser, Debug)]
#[command(name = "gantry", version, about, long_about = None)]
struct Cli {
    /// Path to the deployment spec YAML file
    #[arg(short = 'f', long = "config", default_value = gantry::DEFAULT_SPEC_PATH)]
    config: PathBuf,

    /// Deploy flow to run: all, standard, docker, k8s, or notify
    #[arg(long, env = "GANTRY_FLOW", default_value = "all")]
    flow: FlowKind,

    /// Override the spec's environment tag
    #[arg(long = "env", env = "GANTRY_ENV")]
    environment: Option<String>,

    /// Kubeconfig path, overriding the spec's cluster section
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Gantry starting...");

    let mut spec = config::load(&cli.config)?;
    if let Some(environment) = cli.environment {
        spec.environment = environment;
    }

    // The cluster client only exists for flows that reconcile; a
    // docker-only or notify-only run must not require a reachable cluster.
    let reconciler = match spec.cluster.as_ref() {
        Some(cluster) if cli.flow.steps().contains(&StepKind::ClusterReconcile) => {
            let kubeconfig = cli.kubeconfig.as_deref().or(cluster.kubeconfig.as_deref());
            let api = KubeClusterApi::connect(kubeconfig).await?;
            Some(Reconciler::new(Arc::new(api), Arc::new(SystemClock)))
        }
        _ => None,
    };

    let pipeline = Pipeline::new(
        Arc::new(DockerCli::new()),
        reconciler,
        Notifier::new(Arc::new(ReqwestTransport::new()?)),
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    pipeline.run_with_cancel(&spec, cli.flow, cancel).await?;
    Ok(())
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::warn!("Received Ctrl+C, cancelling the run");
        }
        _ = terminate => {
            tracing::warn!("Received terminate signal, cancelling the run");
        }
    }
}
