//! Gantry - flow-driven deploy pipeline for containerized services
//!
//! Gantry runs a deployment as a short pipeline: build and publish a
//! container image, reconcile the workload and service objects in a
//! Kubernetes namespace, and announce the result to a webhook. A named
//! flow selects which of those steps run; a failing mandatory step stops
//! the run, while a failing notification is only logged.
//!
//! # Modules
//!
//! - [`config`] - Deployment spec loading and validation
//! - [`flow`] - Deploy flows and the pipeline that runs them
//! - [`build`] - Image build, registry login, and publish over the docker CLI
//! - [`quantity`] - Resource quantity strings (`500m`, `128Mi`, ...)
//! - [`workload`] - Translation of the cluster section into platform objects
//! - [`cluster`] - Cluster reconciliation and rollout triggering
//! - [`notify`] - Webhook notifications
//! - [`error`] - Pipeline-level error composition

#![deny(missing_docs)]

pub mod build;
pub mod cluster;
pub mod config;
pub mod error;
pub mod flow;
pub mod notify;
pub mod quantity;
pub mod workload;

pub use error::{PipelineError, StepError};
pub use flow::{FlowKind, Pipeline, StepKind};

/// Default deployment spec path, relative to the invocation directory.
pub const DEFAULT_SPEC_PATH: &str = "configs/deploy.yaml";
