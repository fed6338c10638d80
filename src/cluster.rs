//! Cluster reconciliation
//!
//! Drives the translated workload and service objects into the target
//! namespace with a get-then-create-or-update sequence, then triggers a
//! rollout by stamping a restart annotation on the workload's pod
//! template. All API access goes through the narrow [`ClusterApi`]
//! contract so reconciliation logic runs against a mock in tests, and the
//! rollout timestamp comes from an injected [`Clock`] so it can be pinned.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use thiserror::Error;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::config::ClusterSpec;
use crate::quantity::QuantityError;
use crate::workload;

/// Pod template annotation stamped to force a rollout.
pub const ROLLOUT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Rollout timestamps are second-precision UTC, e.g. `2024-05-17T10:30:00Z`.
const ROLLOUT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// API verb named in operation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Read an object.
    Get,
    /// Create a new object.
    Create,
    /// Replace an existing object.
    Update,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Get => f.write_str("get"),
            Verb::Create => f.write_str("create"),
            Verb::Update => f.write_str("update"),
        }
    }
}

/// Object kind named in operation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// The workload object.
    Deployment,
    /// The network-facing service object.
    Service,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Deployment => f.write_str("Deployment"),
            ObjectKind::Service => f.write_str("Service"),
        }
    }
}

/// Errors from the cluster reconcile step.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// The deployment spec carries no cluster section.
    #[error("deployment spec has no cluster section")]
    MissingClusterSpec,

    /// Credentials could not be loaded or the API client could not be built.
    #[error("cluster unreachable: {message}")]
    Unreachable {
        /// What was being attempted.
        message: String,
        /// Underlying failure, when one exists.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// One API call against one object failed.
    #[error("could not {verb} {kind} {name:?}: {source}")]
    ObjectOperationFailed {
        /// The verb that failed.
        verb: Verb,
        /// Kind of object being operated on.
        kind: ObjectKind,
        /// Object name.
        name: String,
        /// Underlying API failure.
        #[source]
        source: kube::Error,
    },

    /// A resource bound in the spec failed quantity parsing.
    #[error("invalid resource bounds: {0}")]
    InvalidQuantity(#[from] QuantityError),
}

impl ClusterError {
    /// Unreachable-cluster error with no underlying cause.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
            source: None,
        }
    }

    /// Unreachable-cluster error wrapping its cause.
    pub fn unreachable_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unreachable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Narrow cluster contract: only the verbs the reconciler uses, for only
/// the two kinds it manages.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a Deployment; `None` when it does not exist.
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ClusterError>;

    /// Create a Deployment.
    async fn create_workload(&self, workload: &Deployment) -> Result<(), ClusterError>;

    /// Replace an existing Deployment.
    async fn update_workload(&self, workload: &Deployment) -> Result<(), ClusterError>;

    /// Fetch a Service; `None` when it does not exist.
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ClusterError>;

    /// Create a Service.
    async fn create_service(&self, service: &Service) -> Result<(), ClusterError>;

    /// Replace an existing Service.
    async fn update_service(&self, service: &Service) -> Result<(), ClusterError>;
}

/// Time source for the rollout annotation.
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock reading the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// [`ClusterApi`] backed by a real kube client.
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Build a client from an explicit kubeconfig path, or from the
    /// per-user default (`~/.kube/config`) when none is configured.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, ClusterError> {
        let path = match kubeconfig {
            Some(path) => path.to_path_buf(),
            None => default_kubeconfig_path()?,
        };

        let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
            ClusterError::unreachable_with(
                format!("could not read kubeconfig {}", path.display()),
                e,
            )
        })?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                ClusterError::unreachable_with(
                    format!("could not load kubeconfig {}", path.display()),
                    e,
                )
            })?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

        let client = Client::try_from(config)
            .map_err(|e| ClusterError::unreachable_with("could not construct cluster client", e))?;
        Ok(Self { client })
    }

    fn workloads(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// The platform's conventional per-user credentials file.
fn default_kubeconfig_path() -> Result<PathBuf, ClusterError> {
    let home = dirs::home_dir()
        .ok_or_else(|| ClusterError::unreachable("no home directory to locate a kubeconfig"))?;
    Ok(home.join(".kube").join("config"))
}

fn operation_failed(verb: Verb, kind: ObjectKind, name: &str) -> impl FnOnce(kube::Error) -> ClusterError + '_ {
    move |source| ClusterError::ObjectOperationFailed {
        verb,
        kind,
        name: name.to_string(),
        source,
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ClusterError> {
        match self.workloads(namespace).get(name).await {
            Ok(found) => Ok(Some(found)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(source) => Err(operation_failed(Verb::Get, ObjectKind::Deployment, name)(source)),
        }
    }

    async fn create_workload(&self, workload: &Deployment) -> Result<(), ClusterError> {
        let namespace = workload.metadata.namespace.as_deref().unwrap_or_default();
        let name = workload.metadata.name.as_deref().unwrap_or_default();
        self.workloads(namespace)
            .create(&PostParams::default(), workload)
            .await
            .map(|_| ())
            .map_err(operation_failed(Verb::Create, ObjectKind::Deployment, name))
    }

    async fn update_workload(&self, workload: &Deployment) -> Result<(), ClusterError> {
        let namespace = workload.metadata.namespace.as_deref().unwrap_or_default();
        let name = workload.metadata.name.as_deref().unwrap_or_default();
        self.workloads(namespace)
            .replace(name, &PostParams::default(), workload)
            .await
            .map(|_| ())
            .map_err(operation_failed(Verb::Update, ObjectKind::Deployment, name))
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ClusterError> {
        match self.services(namespace).get(name).await {
            Ok(found) => Ok(Some(found)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(source) => Err(operation_failed(Verb::Get, ObjectKind::Service, name)(source)),
        }
    }

    async fn create_service(&self, service: &Service) -> Result<(), ClusterError> {
        let namespace = service.metadata.namespace.as_deref().unwrap_or_default();
        let name = service.metadata.name.as_deref().unwrap_or_default();
        self.services(namespace)
            .create(&PostParams::default(), service)
            .await
            .map(|_| ())
            .map_err(operation_failed(Verb::Create, ObjectKind::Service, name))
    }

    async fn update_service(&self, service: &Service) -> Result<(), ClusterError> {
        let namespace = service.metadata.namespace.as_deref().unwrap_or_default();
        let name = service.metadata.name.as_deref().unwrap_or_default();
        self.services(namespace)
            .replace(name, &PostParams::default(), service)
            .await
            .map(|_| ())
            .map_err(operation_failed(Verb::Update, ObjectKind::Service, name))
    }
}

/// Drives the translated objects into the cluster.
pub struct Reconciler {
    api: Arc<dyn ClusterApi>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    /// Reconciler over the given cluster contract and clock.
    pub fn new(api: Arc<dyn ClusterApi>, clock: Arc<dyn Clock>) -> Self {
        Self { api, clock }
    }

    /// Run the whole reconcile step: workload, then service, then rollout.
    pub async fn reconcile(
        &self,
        spec: &ClusterSpec,
        image: Option<&str>,
    ) -> Result<(), ClusterError> {
        self.apply_workload(spec, image).await?;
        self.apply_service(spec).await?;
        self.trigger_rollout(spec).await?;
        Ok(())
    }

    /// Create or update the workload object.
    ///
    /// Translation runs fresh on every call. When the object already
    /// exists, the live resource version is carried onto the replacement
    /// so a concurrent writer loses loudly instead of silently.
    pub async fn apply_workload(
        &self,
        spec: &ClusterSpec,
        image: Option<&str>,
    ) -> Result<(), ClusterError> {
        let mut desired = workload::workload_object(spec)?;
        if let Some(image) = image {
            fill_image(&mut desired, image);
        }

        match self.api.get_workload(&spec.namespace, &spec.workload).await? {
            None => {
                info!(workload = %spec.workload, namespace = %spec.namespace, "creating workload");
                self.api.create_workload(&desired).await
            }
            Some(live) => {
                desired.metadata.resource_version = live.metadata.resource_version;
                info!(workload = %spec.workload, namespace = %spec.namespace, "updating workload");
                self.api.update_workload(&desired).await
            }
        }
    }

    /// Create or update the service object.
    pub async fn apply_service(&self, spec: &ClusterSpec) -> Result<(), ClusterError> {
        let mut desired = workload::service_object(spec);

        match self.api.get_service(&spec.namespace, &spec.service).await? {
            None => {
                info!(service = %spec.service, namespace = %spec.namespace, "creating service");
                self.api.create_service(&desired).await
            }
            Some(live) => {
                desired.metadata.resource_version = live.metadata.resource_version;
                // clusterIP is immutable; a replace that omits the live value
                // is rejected by the API server.
                if let (Some(desired_spec), Some(live_spec)) =
                    (desired.spec.as_mut(), live.spec)
                {
                    desired_spec.cluster_ip = live_spec.cluster_ip;
                    desired_spec.cluster_ips = live_spec.cluster_ips;
                }
                info!(service = %spec.service, namespace = %spec.namespace, "updating service");
                self.api.update_service(&desired).await
            }
        }
    }

    /// Stamp the rollout annotation on the live workload's pod template.
    ///
    /// The image reference is never touched here; the timestamp change
    /// alone is what makes the platform restart pods.
    pub async fn trigger_rollout(&self, spec: &ClusterSpec) -> Result<(), ClusterError> {
        let mut live = self
            .api
            .get_workload(&spec.namespace, &spec.workload)
            .await?
            .ok_or_else(|| {
                operation_failed(Verb::Get, ObjectKind::Deployment, &spec.workload)(not_found(
                    "deployments",
                    &spec.workload,
                ))
            })?;

        let stamp = self.clock.now().format(ROLLOUT_TIMESTAMP_FORMAT).to_string();
        let workload_spec = live.spec.get_or_insert_with(Default::default);
        let template_meta = workload_spec
            .template
            .metadata
            .get_or_insert_with(Default::default);
        template_meta
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ROLLOUT_ANNOTATION.to_string(), stamp.clone());

        info!(workload = %spec.workload, restarted_at = %stamp, "triggering rollout");
        self.api.update_workload(&live).await
    }
}

// The build section owns image identity; translation leaves the slot empty.
fn fill_image(workload: &mut Deployment, image: &str) {
    if let Some(spec) = workload.spec.as_mut() {
        if let Some(pod) = spec.template.spec.as_mut() {
            if let Some(container) = pod.containers.first_mut() {
                container.image = Some(image.to_string());
            }
        }
    }
}

fn not_found(plural: &str, name: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{plural} {name:?} not found"),
        reason: "NotFound".to_string(),
        code: 404,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvVar, PortMapping, Protocol};
    use chrono::TimeZone;
    use mockall::Sequence;

    fn cluster_spec() -> ClusterSpec {
        ClusterSpec {
            kubeconfig: None,
            namespace: "demo".into(),
            workload: "demo-web-app".into(),
            service: "demo-web-app-svc".into(),
            replicas: 2,
            resources: None,
            ports: vec![PortMapping {
                name: "http".into(),
                port: 80,
                target_port: 8080,
                protocol: Protocol::Tcp,
            }],
            env: vec![EnvVar {
                name: "APP_ENV".into(),
                value: "staging".into(),
            }],
        }
    }

    fn frozen_clock() -> Arc<MockClock> {
        let mut clock = MockClock::new();
        clock.expect_now().returning(|| {
            Utc.with_ymd_and_hms(2024, 5, 17, 10, 30, 0).single().unwrap()
        });
        Arc::new(clock)
    }

    fn api_error(code: u16, message: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: String::new(),
            code,
        })
    }

    fn live_workload(resource_version: &str, image: &str) -> Deployment {
        let spec = cluster_spec();
        let mut workload = workload::workload_object(&spec).unwrap();
        workload.metadata.resource_version = Some(resource_version.to_string());
        fill_image(&mut workload, image);
        workload
    }

    /// Story: a workload the cluster has never seen gets created
    #[tokio::test]
    async fn story_absent_workload_is_created_with_the_build_image() {
        let mut api = MockClusterApi::new();
        api.expect_get_workload()
            .withf(|namespace, name| namespace == "demo" && name == "demo-web-app")
            .returning(|_, _| Ok(None));
        api.expect_create_workload()
            .withf(|workload| {
                let container =
                    &workload.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
                container.image.as_deref() == Some("registry.example.com/demo:1.4.2")
                    && workload.metadata.resource_version.is_none()
            })
            .returning(|_| Ok(()));

        let reconciler = Reconciler::new(Arc::new(api), frozen_clock());
        reconciler
            .apply_workload(&cluster_spec(), Some("registry.example.com/demo:1.4.2"))
            .await
            .unwrap();
    }

    /// Story: an existing workload is replaced, never re-created
    ///
    /// The replacement must carry the live object's resource version so a
    /// concurrent writer surfaces as a conflict instead of a lost update.
    #[tokio::test]
    async fn story_existing_workload_is_updated_with_its_resource_version() {
        let mut api = MockClusterApi::new();
        api.expect_get_workload()
            .returning(|_, _| Ok(Some(live_workload("41", "registry.example.com/demo:1.4.1"))));
        api.expect_update_workload()
            .withf(|workload| workload.metadata.resource_version.as_deref() == Some("41"))
            .returning(|_| Ok(()));

        let reconciler = Reconciler::new(Arc::new(api), frozen_clock());
        reconciler
            .apply_workload(&cluster_spec(), Some("registry.example.com/demo:1.4.2"))
            .await
            .unwrap();
    }

    /// Story: with no build section the image slot simply stays open
    #[tokio::test]
    async fn story_workload_without_image_keeps_the_slot_empty() {
        let mut api = MockClusterApi::new();
        api.expect_get_workload().returning(|_, _| Ok(None));
        api.expect_create_workload()
            .withf(|workload| {
                workload.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
                    .image
                    .is_none()
            })
            .returning(|_| Ok(()));

        let reconciler = Reconciler::new(Arc::new(api), frozen_clock());
        reconciler.apply_workload(&cluster_spec(), None).await.unwrap();
    }

    /// Story: a service replace keeps the immutable cluster IP
    #[tokio::test]
    async fn story_service_update_carries_resource_version_and_cluster_ip() {
        let mut live = workload::service_object(&cluster_spec());
        live.metadata.resource_version = Some("9".to_string());
        if let Some(spec) = live.spec.as_mut() {
            spec.cluster_ip = Some("10.96.0.17".to_string());
        }

        let mut api = MockClusterApi::new();
        api.expect_get_service()
            .returning(move |_, _| Ok(Some(live.clone())));
        api.expect_update_service()
            .withf(|service| {
                let spec = service.spec.as_ref().unwrap();
                service.metadata.resource_version.as_deref() == Some("9")
                    && spec.cluster_ip.as_deref() == Some("10.96.0.17")
            })
            .returning(|_| Ok(()));

        let reconciler = Reconciler::new(Arc::new(api), frozen_clock());
        reconciler.apply_service(&cluster_spec()).await.unwrap();
    }

    /// Story: a rollout stamps the clock's time and leaves the image alone
    #[tokio::test]
    async fn story_rollout_stamps_annotation_without_touching_the_image() {
        let mut api = MockClusterApi::new();
        api.expect_get_workload()
            .returning(|_, _| Ok(Some(live_workload("7", "registry.example.com/demo:1.4.1"))));
        api.expect_update_workload()
            .withf(|workload| {
                let spec = workload.spec.as_ref().unwrap();
                let annotations = spec
                    .template
                    .metadata
                    .as_ref()
                    .and_then(|m| m.annotations.as_ref())
                    .unwrap();
                annotations[ROLLOUT_ANNOTATION] == "2024-05-17T10:30:00Z"
                    && spec.template.spec.as_ref().unwrap().containers[0].image.as_deref()
                        == Some("registry.example.com/demo:1.4.1")
            })
            .returning(|_| Ok(()));

        let reconciler = Reconciler::new(Arc::new(api), frozen_clock());
        reconciler.trigger_rollout(&cluster_spec()).await.unwrap();
    }

    /// Story: rolling out a workload that does not exist is an error
    #[tokio::test]
    async fn story_rollout_of_missing_workload_fails() {
        let mut api = MockClusterApi::new();
        api.expect_get_workload().returning(|_, _| Ok(None));

        let reconciler = Reconciler::new(Arc::new(api), frozen_clock());
        let err = reconciler.trigger_rollout(&cluster_spec()).await.unwrap_err();

        match err {
            ClusterError::ObjectOperationFailed { verb, kind, name, .. } => {
                assert_eq!(verb, Verb::Get);
                assert_eq!(kind, ObjectKind::Deployment);
                assert_eq!(name, "demo-web-app");
            }
            other => panic!("expected ObjectOperationFailed, got {other:?}"),
        }
    }

    /// Story: the full reconcile runs workload, service, rollout in order
    #[tokio::test]
    async fn story_reconcile_applies_workload_then_service_then_rollout() {
        let mut seq = Sequence::new();
        let mut api = MockClusterApi::new();

        api.expect_get_workload()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        api.expect_create_workload()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        api.expect_get_service()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        api.expect_create_service()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        api.expect_get_workload()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(live_workload("1", "registry.example.com/demo:1.4.2"))));
        api.expect_update_workload()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let reconciler = Reconciler::new(Arc::new(api), frozen_clock());
        reconciler
            .reconcile(&cluster_spec(), Some("registry.example.com/demo:1.4.2"))
            .await
            .unwrap();
    }

    /// Story: an API rejection names the verb, kind, and object
    #[tokio::test]
    async fn story_api_rejection_names_the_failed_operation() {
        let mut api = MockClusterApi::new();
        api.expect_get_workload().returning(|_, _| Ok(None));
        api.expect_create_workload().returning(|workload| {
            Err(operation_failed(
                Verb::Create,
                ObjectKind::Deployment,
                workload.metadata.name.as_deref().unwrap_or_default(),
            )(api_error(409, "object was modified")))
        });

        let reconciler = Reconciler::new(Arc::new(api), frozen_clock());
        let err = reconciler
            .apply_workload(&cluster_spec(), None)
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("create"));
        assert!(text.contains("Deployment"));
        assert!(text.contains("demo-web-app"));
    }

    /// Story: a bad quantity stops reconciliation before any API call
    #[tokio::test]
    async fn story_bad_quantity_fails_before_touching_the_cluster() {
        let mut spec = cluster_spec();
        spec.resources = Some(crate::config::ResourceBounds {
            cpu_limit: Some("fast".into()),
            ..Default::default()
        });

        // No expectations set: any API call would panic the test.
        let api = MockClusterApi::new();
        let reconciler = Reconciler::new(Arc::new(api), frozen_clock());

        let err = reconciler.apply_workload(&spec, None).await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidQuantity(_)));
        assert!(err.to_string().contains("fast"));
    }
}
