//! Pure translation from a cluster spec to Kubernetes objects
//!
//! Translation is deterministic and does no I/O: the reconciler calls in
//! here immediately before each create or update so the objects it sends
//! are always derived from the current spec. The workload, its pod
//! template, and the service all carry the same single `app` selector
//! label, which is what ties the service to the workload's pods.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as ApiQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::{ClusterSpec, ResourceBounds};
use crate::quantity::{Quantity, QuantityError};

/// Label key tying a workload's pods to its service.
pub const APP_LABEL: &str = "app";

fn app_labels(workload: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), workload.to_string())])
}

/// Translate the cluster section into a Deployment.
///
/// The container image is deliberately left unset: the reconciler fills
/// it from the build section's image reference when one exists, so shape
/// translation and image identity stay decoupled.
pub fn workload_object(spec: &ClusterSpec) -> Result<Deployment, QuantityError> {
    let labels = app_labels(&spec.workload);

    let ports: Vec<ContainerPort> = spec
        .ports
        .iter()
        .map(|mapping| ContainerPort {
            name: Some(mapping.name.clone()),
            container_port: mapping.target_port,
            protocol: Some(mapping.protocol.to_string()),
            ..Default::default()
        })
        .collect();

    let env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|var| EnvVar {
            name: var.name.clone(),
            value: Some(var.value.clone()),
            ..Default::default()
        })
        .collect();

    let resources = spec
        .resources
        .as_ref()
        .map(resource_requirements)
        .transpose()?;

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(spec.workload.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: spec.workload.clone(),
                        ports: Some(ports),
                        env: Some(env),
                        resources,
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Translate the cluster section into a ClusterIP Service.
pub fn service_object(spec: &ClusterSpec) -> Service {
    let labels = app_labels(&spec.workload);

    let ports: Vec<ServicePort> = spec
        .ports
        .iter()
        .map(|mapping| ServicePort {
            name: Some(mapping.name.clone()),
            port: mapping.port,
            target_port: Some(IntOrString::Int(mapping.target_port)),
            protocol: Some(mapping.protocol.to_string()),
            ..Default::default()
        })
        .collect();

    Service {
        metadata: ObjectMeta {
            name: Some(spec.service.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(ports),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resource_requirements(bounds: &ResourceBounds) -> Result<ResourceRequirements, QuantityError> {
    let mut requests = BTreeMap::new();
    if let Some(cpu) = present(&bounds.cpu_request) {
        requests.insert("cpu".to_string(), parsed(cpu)?);
    }
    if let Some(memory) = present(&bounds.memory_request) {
        requests.insert("memory".to_string(), parsed(memory)?);
    }

    let mut limits = BTreeMap::new();
    if let Some(cpu) = present(&bounds.cpu_limit) {
        limits.insert("cpu".to_string(), parsed(cpu)?);
    }
    if let Some(memory) = present(&bounds.memory_limit) {
        limits.insert("memory".to_string(), parsed(memory)?);
    }

    Ok(ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    })
}

// Empty strings count as absent, same as a missing key.
fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|value| !value.is_empty())
}

// Validate the platform grammar, then hand the canonical string to the API type.
fn parsed(raw: &str) -> Result<ApiQuantity, QuantityError> {
    let quantity = Quantity::parse(raw)?;
    Ok(ApiQuantity(quantity.to_string()))
}
