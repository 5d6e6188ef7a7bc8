use std::{
    fmt::{Display, Formatter},
    time::Duration,
};

use futures::{future::join_all, FutureExt};
use k8s_openapi::api::{
    authorization::v1::{ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec},
    core::v1::Pod,
};
use kube::{
    api::{ListParams, PostParams},
    core::{ObjectList, Request},
    Api, Client,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::Namespace,
    convention::{self, ClusterCall, Convention},
    credential::{ClusterCredential, Mode},
    error::ClientError,
    transport::{self, ClusterTarget, DirectFailure, TlsMode},
};

fn tls_guidance(mode: Mode) -> &'static str {
    match mode {
        Mode::External => {
            "set K8S_CA_PATH to the cluster CA bundle, \
             or set K8S_SKIP_TLS_VERIFY=true to accept an unverified certificate"
        }
        Mode::InCluster => {
            "check the service-account CA bundle mounted at --ca-path, \
             or set K8S_SKIP_TLS_VERIFY=true to accept an unverified certificate"
        }
    }
}

/// Outcome of one preflight. Never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightResult {
    pub ok: bool,
    pub detail: String,
    /// The read that succeeded, if any.
    pub method: Option<ProbeMethod>,
    /// Where that read went. Submission goes to the same place.
    pub target: Option<ClusterTarget>,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProbeMethod {
    Direct { endpoint: String, tls: TlsMode },
    Structured { endpoint: String, convention: Convention },
}

impl Display for ProbeMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeMethod::Direct { endpoint, tls } => write!(f, "direct read of {endpoint} ({tls})"),
            ProbeMethod::Structured {
                endpoint,
                convention,
            } => write!(f, "structured client at {endpoint} ({convention} convention)"),
        }
    }
}

/// Verdict of one RBAC self-check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Permission {
    pub verb: &'static str,
    pub resource: &'static str,
    /// `None` when the cluster could not be asked.
    pub allowed: Option<bool>,
    pub reason: Option<String>,
}

impl Display for Permission {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let verdict = match self.allowed {
            Some(true) => "allowed",
            Some(false) => "denied",
            None => "unknown",
        };
        write!(f, "{} {}={verdict}", self.verb, self.resource)?;
        match &self.reason {
            Some(reason) if !reason.is_empty() => write!(f, " ({reason})"),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Check {
    verb: &'static str,
    group: Option<&'static str>,
    resource: &'static str,
}

const LIST_PODS: Check = Check {
    verb: "list",
    group: None,
    resource: "pods",
};

const CREATE_JOBS: Check = Check {
    verb: "create",
    group: Some("batch"),
    resource: "jobs",
};

/// Proves a job could be created before creating it. A one-pod list exercises reachability, TLS
/// trust, authentication and namespace RBAC in a single read; a SelfSubjectAccessReview then asks
/// about `create jobs`. Nothing here mutates cluster state.
pub async fn probe(
    credential: &ClusterCredential,
    namespace: &Namespace,
    timeout: Duration,
) -> PreflightResult {
    let mut notes = Vec::new();
    let candidates: Vec<&str> = credential.candidates().collect();
    if candidates.is_empty() {
        let detail = "no Kubernetes API endpoint configured: set K8S_API_URL and K8S_TOKEN, \
                      or run in-cluster with KUBERNETES_SERVICE_HOST set"
            .to_string();
        warn!(%namespace, "preflight failed: no endpoint");
        return PreflightResult {
            ok: false,
            detail,
            method: None,
            target: None,
            permissions: Vec::new(),
        };
    }
    if credential.token.is_none() {
        notes.push("no bearer token available; is the service-account token mounted?".to_string());
    }

    let mut listed = None;
    let mut denied = false;
    for endpoint in &candidates {
        match probe_direct(credential, endpoint, namespace, timeout, &mut notes).await {
            Direct::Listed(target) => {
                listed = Some((
                    ProbeMethod::Direct {
                        endpoint: target.endpoint.clone(),
                        tls: target.tls,
                    },
                    target,
                ));
                break;
            }
            // the credential is valid but unauthorized; no other endpoint will say otherwise
            Direct::Denied => {
                denied = true;
                break;
            }
            Direct::Failed => {}
        }
    }

    if listed.is_none() && !denied {
        listed = probe_structured(credential, namespace, timeout, &mut notes).await;
    }

    let checks: &[Check] = if listed.is_some() {
        &[CREATE_JOBS]
    } else {
        &[LIST_PODS, CREATE_JOBS]
    };
    let review_target = match &listed {
        Some((_, target)) => Some(target.clone()),
        None => ClusterTarget::primary(credential),
    };
    let permissions = match review_target {
        Some(target) => self_check(credential, &target, namespace, checks, timeout).await,
        None => Vec::new(),
    };
    if !permissions.is_empty() {
        let verdicts: Vec<String> = permissions.iter().map(ToString::to_string).collect();
        notes.push(format!("permissions: {}", verdicts.join(", ")));
    }

    let permitted = permissions.iter().all(|p| p.allowed != Some(false));
    match listed {
        Some((method, target)) if permitted => {
            info!(%namespace, %method, "preflight passed");
            notes.insert(0, format!("pods listed via {method}"));
            PreflightResult {
                ok: true,
                detail: notes.join("\n"),
                method: Some(method),
                target: Some(target),
                permissions,
            }
        }
        listed => {
            let detail = notes.join("\n");
            warn!(%namespace, %detail, "preflight failed");
            let (method, target) = listed.unzip();
            PreflightResult {
                ok: false,
                detail,
                method,
                target,
                permissions,
            }
        }
    }
}

enum Direct {
    Listed(ClusterTarget),
    Denied,
    Failed,
}

async fn probe_direct(
    credential: &ClusterCredential,
    endpoint: &str,
    namespace: &Namespace,
    timeout: Duration,
    notes: &mut Vec<String>,
) -> Direct {
    let mut tls = TlsMode::Verify;
    loop {
        let attempt = async {
            let client = transport::http_client(credential, tls, timeout).map_err(|e| match e {
                ClientError::CaBundle(_) => DirectFailure::Tls(e.to_string()),
                other => DirectFailure::Client(other.to_string()),
            })?;
            transport::list_pods(&client, endpoint, namespace).await
        };
        let failure = match attempt.await {
            Ok(count) => {
                debug!(endpoint, %tls, count, "direct pod read succeeded");
                return Direct::Listed(ClusterTarget::new(endpoint, tls));
            }
            Err(failure) => failure,
        };
        debug!(endpoint, %tls, %failure, "direct pod read failed");
        match failure {
            DirectFailure::Tls(_) if tls == TlsMode::Verify && credential.skip_tls_verify => {
                notes.push(format!(
                    "direct {endpoint}: {failure}; retrying without verification"
                ));
                tls = TlsMode::SkipVerify;
            }
            DirectFailure::Tls(_) if tls == TlsMode::Verify => {
                let guidance = tls_guidance(credential.mode);
                notes.push(format!("direct {endpoint}: {failure}; {guidance}"));
                return Direct::Failed;
            }
            DirectFailure::Denied { .. } => {
                notes.push(format!("direct {endpoint} ({tls}): {failure}"));
                return Direct::Denied;
            }
            _ => {
                notes.push(format!("direct {endpoint} ({tls}): {failure}"));
                return Direct::Failed;
            }
        }
    }
}

async fn probe_structured(
    credential: &ClusterCredential,
    namespace: &Namespace,
    timeout: Duration,
    notes: &mut Vec<String>,
) -> Option<(ProbeMethod, ClusterTarget)> {
    let target = ClusterTarget::primary(credential)?;
    let client = match transport::kube_client(credential, &target, timeout).await {
        Ok(client) => client,
        Err(e) => {
            notes.push(format!("structured {target}: {e}"));
            return None;
        }
    };
    match convention::invoke(&ListPods { namespace }, &client, Convention::Scoped).await {
        Ok((count, convention)) => {
            debug!(endpoint = %target.endpoint, %convention, count, "structured pod read succeeded");
            let method = ProbeMethod::Structured {
                endpoint: target.endpoint.clone(),
                convention,
            };
            Some((method, target))
        }
        Err(e) => {
            notes.push(format!("structured {target}: {}", describe_kube_error(&e)));
            None
        }
    }
}

async fn self_check(
    credential: &ClusterCredential,
    target: &ClusterTarget,
    namespace: &Namespace,
    checks: &[Check],
    timeout: Duration,
) -> Vec<Permission> {
    let unknown = |check: &Check, reason: String| Permission {
        verb: check.verb,
        resource: check.resource,
        allowed: None,
        reason: Some(reason),
    };
    let client = match transport::kube_client(credential, target, timeout).await {
        Ok(client) => client,
        Err(e) => {
            return checks
                .iter()
                .map(|check| unknown(check, format!("self-check unavailable: {e}")))
                .collect()
        }
    };

    let reviews = checks.iter().map(|check| {
        let client = &client;
        async move {
            let review = AccessReview {
                namespace,
                check: *check,
            };
            match convention::invoke(&review, client, Convention::Scoped).await {
                Ok((permission, _)) => permission,
                Err(e) => unknown(
                    check,
                    format!("self-check unavailable: {}", describe_kube_error(&e)),
                ),
            }
        }
    });
    join_all(reviews).await
}

pub(crate) fn describe_kube_error(err: &kube::Error) -> String {
    match err {
        kube::Error::Api(response) => format!("HTTP {}: {}", response.code, response.message),
        other => other.to_string(),
    }
}

struct ListPods<'a> {
    namespace: &'a Namespace,
}

impl ClusterCall for ListPods<'_> {
    type Output = usize;

    fn describe(&self) -> String {
        format!("list pods in {}", self.namespace)
    }

    fn call<'a>(
        &'a self,
        client: &'a Client,
        convention: Convention,
    ) -> futures::future::BoxFuture<'a, kube::Result<usize>> {
        async move {
            let params = ListParams::default().limit(1);
            let list: ObjectList<Pod> = match convention {
                Convention::Scoped => {
                    Api::<Pod>::namespaced(client.clone(), self.namespace.as_str())
                        .list(&params)
                        .await?
                }
                Convention::Request => {
                    let request = Request::new(format!("/api/v1/namespaces/{}/pods", self.namespace))
                        .list(&params)
                        .map_err(kube::Error::BuildRequest)?;
                    client.request(request).await?
                }
            };
            Ok(list.items.len())
        }
        .boxed()
    }
}

struct AccessReview<'a> {
    namespace: &'a Namespace,
    check: Check,
}

impl AccessReview<'_> {
    fn review(&self) -> SelfSubjectAccessReview {
        SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(self.namespace.to_string()),
                    verb: Some(self.check.verb.to_string()),
                    group: self.check.group.map(str::to_string),
                    resource: Some(self.check.resource.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl ClusterCall for AccessReview<'_> {
    type Output = Permission;

    fn describe(&self) -> String {
        format!(
            "review {} {} in {}",
            self.check.verb, self.check.resource, self.namespace
        )
    }

    fn call<'a>(
        &'a self,
        client: &'a Client,
        convention: Convention,
    ) -> futures::future::BoxFuture<'a, kube::Result<Permission>> {
        async move {
            let review = self.review();
            let params = PostParams::default();
            let answered: SelfSubjectAccessReview = match convention {
                Convention::Scoped => {
                    Api::<SelfSubjectAccessReview>::all(client.clone())
                        .create(&params, &review)
                        .await?
                }
                Convention::Request => {
                    let body = serde_json::to_vec(&review).map_err(kube::Error::SerdeError)?;
                    let request =
                        Request::new("/apis/authorization.k8s.io/v1/selfsubjectaccessreviews")
                            .create(&params, body)
                            .map_err(kube::Error::BuildRequest)?;
                    client.request(request).await?
                }
            };
            let status = answered.status.unwrap_or_default();
            Ok(Permission {
                verb: self.check.verb,
                resource: self.check.resource,
                allowed: Some(status.allowed),
                reason: status.reason.or(status.evaluation_error),
            })
        }
        .boxed()
    }
}
