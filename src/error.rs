//! Error types for the deploy pipeline
//!
//! Step modules own their error types; this module stitches them into
//! the single failure a deploy run reports. A step failure always names
//! the step it came from and keeps the module error as its source.

use thiserror::Error;

use crate::build::BuildError;
use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::flow::StepKind;
use crate::notify::NotifyError;

/// Failure of a single pipeline step.
#[derive(Debug, Error)]
pub enum StepError {
    /// The image build and publish step failed.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// The cluster reconcile step failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The notify step failed.
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// What a deploy run reports when it does not succeed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The deployment spec could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A step failed and the run stopped there.
    #[error("{step} step failed: {source}")]
    Step {
        /// Step that failed.
        step: StepKind,
        /// What went wrong inside the step.
        #[source]
        source: StepError,
    },

    /// The run was cancelled before completing.
    #[error("deploy run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Wrap a step failure with the step that produced it.
    pub fn step(step: StepKind, source: impl Into<StepError>) -> Self {
        Self::Step {
            step,
            source: source.into(),
        }
    }
}
