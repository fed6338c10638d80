//! Deploy flows and the pipeline that runs them
//!
//! A flow is a named, statically known subset of the three pipeline
//! steps. The pipeline resolves the flow to its step list and runs the
//! steps strictly in order, stopping at the first failure of a mandatory
//! step. The notify step is best-effort: its failure is logged and the
//! run still succeeds.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::build::{BuildError, ImageToolchain};
use crate::cluster::{ClusterError, Reconciler};
use crate::config::{ConfigError, DeploymentSpec};
use crate::error::{PipelineError, StepError};
use crate::notify::{Notifier, NotifyError};

/// Named deploy flow selecting which steps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Build and publish, reconcile, notify.
    All,
    /// Build and publish only.
    Docker,
    /// Cluster reconcile only.
    Kubernetes,
    /// Notification only.
    Notify,
    /// Build and publish, then reconcile, without notifying.
    Standard,
}

/// Every flow, in declaration order.
pub const ALL_FLOWS: [FlowKind; 5] = [
    FlowKind::All,
    FlowKind::Docker,
    FlowKind::Kubernetes,
    FlowKind::Notify,
    FlowKind::Standard,
];

impl FlowKind {
    /// The steps this flow runs, in order. Never empty.
    pub fn steps(self) -> &'static [StepKind] {
        match self {
            FlowKind::All => &[
                StepKind::BuildPublish,
                StepKind::ClusterReconcile,
                StepKind::Notify,
            ],
            FlowKind::Docker => &[StepKind::BuildPublish],
            FlowKind::Kubernetes => &[StepKind::ClusterReconcile],
            FlowKind::Notify => &[StepKind::Notify],
            FlowKind::Standard => &[StepKind::BuildPublish, StepKind::ClusterReconcile],
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKind::All => f.write_str("all"),
            FlowKind::Docker => f.write_str("docker"),
            FlowKind::Kubernetes => f.write_str("k8s"),
            FlowKind::Notify => f.write_str("notify"),
            FlowKind::Standard => f.write_str("standard"),
        }
    }
}

impl FromStr for FlowKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" | "full" => Ok(FlowKind::All),
            "docker" => Ok(FlowKind::Docker),
            "k8s" | "kubernetes" => Ok(FlowKind::Kubernetes),
            "notify" => Ok(FlowKind::Notify),
            "standard" => Ok(FlowKind::Standard),
            _ => Err(ConfigError::UnsupportedFlow(value.to_string())),
        }
    }
}

/// One pipeline step, named for logs and wrapped errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Build the container image and push it to the registry.
    BuildPublish,
    /// Drive the workload and service objects into the cluster.
    ClusterReconcile,
    /// Deliver the deployment summary to the webhook.
    Notify,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::BuildPublish => f.write_str("build-publish"),
            StepKind::ClusterReconcile => f.write_str("cluster-reconcile"),
            StepKind::Notify => f.write_str("notify"),
        }
    }
}

/// Where a run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No step has started.
    Pending,
    /// The step at this index is in flight.
    Running(usize),
    /// Every mandatory step finished.
    Succeeded,
    /// The step at this index failed and the run stopped.
    Failed(usize),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => f.write_str("pending"),
            RunState::Running(index) => write!(f, "running(step {index})"),
            RunState::Succeeded => f.write_str("succeeded"),
            RunState::Failed(index) => write!(f, "failed(step {index})"),
        }
    }
}

/// The deployment summary posted by the notify step.
pub fn deploy_message(spec: &DeploymentSpec) -> String {
    format!(
        "project {} deployed successfully in {} environment, version: {}",
        spec.project, spec.environment, spec.version
    )
}

/// Runs deploy flows over the three step collaborators.
///
/// The reconciler is optional so flows that never reconcile can run
/// without a cluster client ever being constructed.
pub struct Pipeline {
    toolchain: Arc<dyn ImageToolchain>,
    reconciler: Option<Reconciler>,
    notifier: Notifier,
}

impl Pipeline {
    /// Pipeline over the given collaborators.
    pub fn new(
        toolchain: Arc<dyn ImageToolchain>,
        reconciler: Option<Reconciler>,
        notifier: Notifier,
    ) -> Self {
        Self {
            toolchain,
            reconciler,
            notifier,
        }
    }

    /// Run the flow's steps in order, stopping at the first failure of a
    /// mandatory step.
    pub async fn run(&self, spec: &DeploymentSpec, flow: FlowKind) -> Result<(), PipelineError> {
        self.run_with_cancel(spec, flow, CancellationToken::new())
            .await
    }

    /// [`run`](Self::run) observing a cancellation token between and
    /// during steps. Work in flight when the token fires is abandoned,
    /// not rolled back.
    pub async fn run_with_cancel(
        &self,
        spec: &DeploymentSpec,
        flow: FlowKind,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let steps = flow.steps();
        info!(
            %flow,
            project = %spec.project,
            environment = %spec.environment,
            "starting deploy run"
        );

        let mut state = RunState::Pending;
        for (index, &step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(%step, %state, "deploy run cancelled");
                return Err(PipelineError::Cancelled);
            }

            state = RunState::Running(index);
            info!(%step, %state, project = %spec.project, environment = %spec.environment, "step starting");

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(%step, %state, "deploy run cancelled");
                    return Err(PipelineError::Cancelled);
                }
                outcome = self.run_step(spec, step) => outcome,
            };

            match outcome {
                Ok(()) => {
                    info!(%step, project = %spec.project, environment = %spec.environment, "step finished");
                }
                Err(source) if step == StepKind::Notify => {
                    warn!(%step, error = %source, "notification failed; run continues");
                }
                Err(source) => {
                    state = RunState::Failed(index);
                    warn!(%step, %state, error = %source, "step failed; aborting run");
                    return Err(PipelineError::step(step, source));
                }
            }
        }

        state = RunState::Succeeded;
        info!(%state, project = %spec.project, version = %spec.version, "deploy run finished");
        Ok(())
    }

    async fn run_step(&self, spec: &DeploymentSpec, step: StepKind) -> Result<(), StepError> {
        match step {
            StepKind::BuildPublish => self.build_publish(spec).await.map_err(StepError::from),
            StepKind::ClusterReconcile => {
                self.cluster_reconcile(spec).await.map_err(StepError::from)
            }
            StepKind::Notify => self.notify(spec).await.map_err(StepError::from),
        }
    }

    async fn build_publish(&self, spec: &DeploymentSpec) -> Result<(), BuildError> {
        let build = spec.build.as_ref().ok_or(BuildError::MissingBuildSpec)?;

        self.toolchain
            .build(&build.image, &build.dockerfile, &build.context)
            .await?;
        if let Some((username, password)) = build.credentials() {
            self.toolchain
                .authenticate(&build.registry, username, password)
                .await?;
        }
        self.toolchain.publish(&build.image).await?;
        Ok(())
    }

    async fn cluster_reconcile(&self, spec: &DeploymentSpec) -> Result<(), ClusterError> {
        let cluster = spec.cluster.as_ref().ok_or(ClusterError::MissingClusterSpec)?;
        let reconciler = self
            .reconciler
            .as_ref()
            .ok_or_else(|| ClusterError::unreachable("no cluster client configured for this run"))?;

        let image = spec.build.as_ref().map(|build| build.image.as_str());
        reconciler.reconcile(cluster, image).await
    }

    async fn notify(&self, spec: &DeploymentSpec) -> Result<(), NotifyError> {
        let message = deploy_message(spec);
        self.notifier
            .send(spec.notify.as_ref(), &message)
            .await
            .map(|_| ())
    }
}
