use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements},
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::core::ObjectMeta;

use crate::{
    common::{JobDefinition, Quantities},
    config::Namespace,
};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER: &str = "jobshot";
pub const JOB_LABEL: &str = "jobshot.io/job";
pub const DISPLAY_NAME_ANNOTATION: &str = "jobshot.io/display-name";

/// A Job ready to be created. Rendering is pure; the same input always serializes to the same
/// bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedJob {
    pub name: String,
    pub namespace: Namespace,
    pub job: Job,
}

/// Cluster object name for a display name: trimmed, lowercased, each whitespace run replaced by
/// one hyphen. Lossy, so the display name is kept in an annotation.
// Distinct names can collide ("Run Job" and "run  job"); the catalog rejects such pairs.
pub fn slug(name_for_humans: &str) -> String {
    name_for_humans
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

pub fn build(definition: &JobDefinition, namespace: &Namespace) -> RenderedJob {
    let name = slug(&definition.name);
    let labels: BTreeMap<String, String> = [
        (MANAGED_BY_LABEL.to_string(), MANAGER.to_string()),
        (JOB_LABEL.to_string(), name.clone()),
    ]
    .into();
    let annotations: BTreeMap<String, String> = [(
        DISPLAY_NAME_ANNOTATION.to_string(),
        definition.name.clone(),
    )]
    .into();

    let container = Container {
        name: name.clone(),
        image: Some(definition.container.clone()),
        command: definition.entrypoint.clone(),
        args: Some(definition.parameters.clone()),
        resources: definition.resources.as_ref().map(|r| ResourceRequirements {
            requests: r.requests.as_ref().map(quantities),
            limits: r.limits.as_ref().map(quantities),
            ..Default::default()
        }),
        ..Default::default()
    };
    let pod_spec = PodSpec {
        containers: vec![container],
        restart_policy: Some("Never".to_string()),
        ..Default::default()
    };
    let job = Job {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.as_str().to_string()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            // one-shot jobs must not multiply silently
            backoff_limit: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    };

    RenderedJob {
        name,
        namespace: namespace.clone(),
        job,
    }
}

fn quantities(q: &Quantities) -> BTreeMap<String, Quantity> {
    [("cpu", &q.cpu), ("memory", &q.memory)]
        .into_iter()
        .filter_map(|(key, value)| Some((key.to_string(), Quantity(value.clone()?))))
        .collect()
}
