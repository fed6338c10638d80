//! Deployment specification loading and validation
//!
//! A deployment spec is a single YAML document identifying the project
//! being deployed plus up to three optional sections: `build` (container
//! image build and publish), `cluster` (the Kubernetes target), and
//! `notify` (webhook announcement). The spec is read once per run and
//! never mutated by the pipeline.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating a deployment spec.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The requested flow name is not one of the supported flows.
    #[error("unsupported deploy flow: {0:?}")]
    UnsupportedFlow(String),

    /// The spec file could not be read.
    #[error("could not read deployment spec {}: {source}", path.display())]
    Unreadable {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The spec file did not deserialize into a deployment spec.
    #[error("could not parse deployment spec {}: {source}", path.display())]
    Malformed {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying YAML failure.
        #[source]
        source: serde_yaml::Error,
    },

    /// A structural rule of the spec was violated.
    #[error("invalid deployment spec: {0}")]
    Validation(String),
}

impl ConfigError {
    /// Create a validation error with the given message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// One deployment unit: who is deploying what, where, and which
/// optional pipeline sections apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Project being deployed.
    pub project: String,
    /// Person or system responsible for the deployment.
    #[serde(default)]
    pub author: String,
    /// Namespace the deployment unit belongs to.
    pub namespace: String,
    /// Semantic version being rolled out.
    pub version: String,
    /// Environment tag (`dev`, `staging`, `prod`, ...).
    pub environment: String,
    /// Image build and publish section.
    #[serde(default)]
    pub build: Option<BuildSpec>,
    /// Kubernetes target section.
    #[serde(default)]
    pub cluster: Option<ClusterSpec>,
    /// Webhook notification section.
    #[serde(default)]
    pub notify: Option<NotifySpec>,
}

/// How to build and publish the container image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Registry host the image is pushed to.
    pub registry: String,
    /// Registry username; login is skipped unless both credentials are set.
    #[serde(default)]
    pub username: Option<String>,
    /// Registry password.
    #[serde(default)]
    pub password: Option<String>,
    /// Full image reference (`name:tag`), used verbatim for build and push.
    pub image: String,
    /// Dockerfile path relative to the invocation directory.
    pub dockerfile: PathBuf,
    /// Build context directory.
    pub context: PathBuf,
}

impl BuildSpec {
    /// Registry credentials, present only when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some((user, pass))
            }
            _ => None,
        }
    }
}

/// The Kubernetes objects to reconcile and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Explicit kubeconfig path; absent means the per-user default.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Namespace the workload and service live in.
    pub namespace: String,
    /// Name of the workload (Deployment) object.
    pub workload: String,
    /// Name of the Service object.
    pub service: String,
    /// Desired replica count.
    pub replicas: i32,
    /// CPU and memory bounds; each entry is independently optional.
    #[serde(default)]
    pub resources: Option<ResourceBounds>,
    /// Ordered port mappings, translated positionally.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Ordered environment variables, translated positionally.
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

impl ClusterSpec {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.replicas < 0 {
            return Err(ConfigError::validation(format!(
                "replicas must not be negative (got {})",
                self.replicas
            )));
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if !seen.insert(port.name.as_str()) {
                return Err(ConfigError::validation(format!(
                    "duplicate port name {:?} in cluster section",
                    port.name
                )));
            }
        }
        Ok(())
    }
}

/// CPU and memory requests/limits as platform quantity strings.
///
/// Each field stands alone: a spec may request CPU without bounding
/// memory, and so on. Strings are validated at translation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceBounds {
    /// Requested CPU (`500m`, `2`, ...).
    #[serde(default)]
    pub cpu_request: Option<String>,
    /// Requested memory (`128Mi`, `1Gi`, ...).
    #[serde(default)]
    pub memory_request: Option<String>,
    /// CPU ceiling.
    #[serde(default)]
    pub cpu_limit: Option<String>,
    /// Memory ceiling.
    #[serde(default)]
    pub memory_limit: Option<String>,
}

/// One service-to-container port mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port name; must be unique within the list.
    pub name: String,
    /// Port the service exposes.
    pub port: i32,
    /// Port the container listens on.
    pub target_port: i32,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
}

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP (the platform default).
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

/// One container environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Literal value.
    pub value: String,
}

/// Where to announce the deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySpec {
    /// Whether notifications are sent at all.
    #[serde(default)]
    pub enabled: bool,
    /// Webhook endpoint receiving the announcement.
    #[serde(default)]
    pub webhook_url: String,
    /// Optional channel routed by the receiving end.
    #[serde(default)]
    pub channel: Option<String>,
}

impl DeploymentSpec {
    /// Check the structural rules a deserialized spec must satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.is_empty() {
            return Err(ConfigError::validation("project must not be empty"));
        }
        if self.environment.is_empty() {
            return Err(ConfigError::validation("environment must not be empty"));
        }
        if let Some(cluster) = &self.cluster {
            cluster.validate()?;
        }
        Ok(())
    }
}

/// Load a deployment spec from a YAML file and validate it.
pub fn load(path: impl AsRef<Path>) -> Result<DeploymentSpec, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let spec: DeploymentSpec =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
    spec.validate()?;
    Ok(spec)
}
