use std::time::Duration;

use futures::{
    future::{join_all, BoxFuture},
    FutureExt,
};
use k8s_openapi::api::batch::v1::Job;
use kube::{core::Request, Api, Client};
use serde::Serialize;
use tracing::debug;

use crate::{
    config::Namespace,
    convention::{self, ClusterCall, Convention},
    credential::ClusterCredential,
    probe::describe_kube_error,
    transport::{self, ClusterTarget, TlsMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    NotFound,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
}

impl Counts {
    pub fn phase(&self) -> Phase {
        if self.active > 0 {
            Phase::Running
        } else if self.succeeded > 0 {
            Phase::Succeeded
        } else if self.failed > 0 {
            Phase::Failed
        } else {
            Phase::Pending
        }
    }
}

/// Never an error: failures land in `error` so one bad fetch cannot break a polling loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub status: Phase,
    /// `null` when the cluster could not be asked.
    pub exists: Option<bool>,
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Counts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatus {
    fn not_found() -> Self {
        Self {
            status: Phase::NotFound,
            exists: Some(false),
            is_running: false,
            details: None,
            error: None,
        }
    }

    fn unknown(error: String) -> Self {
        Self {
            status: Phase::Unknown,
            exists: None,
            is_running: false,
            details: None,
            error: Some(error),
        }
    }

    fn from_job(job: &Job) -> Self {
        let counts = job
            .status
            .as_ref()
            .map(|s| Counts {
                active: s.active.unwrap_or(0),
                succeeded: s.succeeded.unwrap_or(0),
                failed: s.failed.unwrap_or(0),
            })
            .unwrap_or_default();
        let phase = counts.phase();
        Self {
            status: phase,
            exists: Some(true),
            is_running: phase == Phase::Running,
            details: Some(counts),
            error: None,
        }
    }
}

/// One entry of a batched fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedStatus {
    pub name: String,
    #[serde(flatten)]
    pub status: JobStatus,
}

pub async fn status(
    credential: &ClusterCredential,
    name: &str,
    namespace: &Namespace,
    timeout: Duration,
) -> JobStatus {
    let names = [name.to_string()];
    fetch_all(credential, &names, namespace, timeout)
        .await
        .pop()
        .unwrap_or_else(|| JobStatus::unknown("no status fetched".to_string()))
}

/// Fetches every name concurrently. Results keep the order of `names`.
pub async fn status_many(
    credential: &ClusterCredential,
    names: &[String],
    namespace: &Namespace,
    timeout: Duration,
) -> Vec<NamedStatus> {
    let statuses = fetch_all(credential, names, namespace, timeout).await;
    names
        .iter()
        .cloned()
        .zip(statuses)
        .map(|(name, status)| NamedStatus { name, status })
        .collect()
}

/// Walks the candidate endpoints in order, the way preflight does, so a job created on an
/// alternate endpoint is found there. Only names whose fetch could not reach the cluster move on
/// to the next candidate.
async fn fetch_all(
    credential: &ClusterCredential,
    names: &[String],
    namespace: &Namespace,
    timeout: Duration,
) -> Vec<JobStatus> {
    let mut results: Vec<Option<JobStatus>> = vec![None; names.len()];
    let mut pending: Vec<usize> = (0..names.len()).collect();
    let mut last_error = "no Kubernetes API endpoint configured".to_string();

    for endpoint in credential.candidates() {
        if pending.is_empty() {
            break;
        }
        let target = ClusterTarget::new(endpoint, TlsMode::for_credential(credential));
        let client = match transport::kube_client(credential, &target, timeout).await {
            Ok(client) => client,
            Err(e) => {
                last_error = format!("{target}: {e}");
                continue;
            }
        };

        let fetches = pending.iter().map(|&i| {
            let client = &client;
            let get = GetJob {
                name: &names[i],
                namespace,
            };
            async move { convention::invoke(&get, client, Convention::Scoped).await }
        });
        let outcomes = join_all(fetches).await;

        let mut unreachable = Vec::new();
        for (i, outcome) in pending.iter().copied().zip(outcomes) {
            results[i] = match outcome {
                Ok((Some(job), _)) => Some(JobStatus::from_job(&job)),
                Ok((None, _)) => Some(JobStatus::not_found()),
                Err(e) if transport::is_unreachable(&e) => {
                    debug!(job = %names[i], endpoint = %target.endpoint, error = %e, "endpoint unreachable");
                    last_error = format!("{target}: {}", describe_kube_error(&e));
                    unreachable.push(i);
                    None
                }
                Err(e) => {
                    debug!(job = %names[i], %namespace, error = %e, "status fetch failed");
                    Some(JobStatus::unknown(describe_kube_error(&e)))
                }
            };
        }
        pending = unreachable;
    }

    results
        .into_iter()
        .map(|status| status.unwrap_or_else(|| JobStatus::unknown(last_error.clone())))
        .collect()
}

struct GetJob<'a> {
    name: &'a str,
    namespace: &'a Namespace,
}

impl ClusterCall for GetJob<'_> {
    /// `None` when the job does not exist.
    type Output = Option<Job>;

    fn describe(&self) -> String {
        format!("get job {} in {}", self.name, self.namespace)
    }

    fn call<'a>(
        &'a self,
        client: &'a Client,
        convention: Convention,
    ) -> BoxFuture<'a, kube::Result<Option<Job>>> {
        async move {
            let fetched = match convention {
                Convention::Scoped => {
                    Api::<Job>::namespaced(client.clone(), self.namespace.as_str())
                        .get(self.name)
                        .await
                }
                Convention::Request => {
                    let request =
                        Request::new(format!("/apis/batch/v1/namespaces/{}/jobs", self.namespace))
                            .get(self.name)
                            .map_err(kube::Error::BuildRequest)?;
                    client.request::<Job>(request).await
                }
            };
            match fetched {
                Ok(job) => Ok(Some(job)),
                Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
                Err(e) => Err(e),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn ns() -> Namespace {
        "jobshot".parse().unwrap()
    }

    async fn mock_job(server: &MockServer, name: &str, status: serde_json::Value) {
        let body = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": name, "namespace": "jobshot" },
            "status": status
        });
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(format!("/apis/batch/v1/namespaces/jobshot/jobs/{name}"));
                then.status(200).json_body(body);
            })
            .await;
    }

    async fn mock_missing(server: &MockServer, name: &str) {
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(format!("/apis/batch/v1/namespaces/jobshot/jobs/{name}"));
                then.status(404).json_body(json!({
                    "kind": "Status", "apiVersion": "v1", "metadata": {},
                    "status": "Failure",
                    "message": format!("jobs.batch \"{name}\" not found"),
                    "reason": "NotFound",
                    "code": 404
                }));
            })
            .await;
    }

    #[test]
    fn phases() {
        let counts = |active, succeeded, failed| Counts {
            active,
            succeeded,
            failed,
        };
        assert_eq!(counts(1, 0, 1).phase(), Phase::Running);
        assert_eq!(counts(0, 1, 1).phase(), Phase::Succeeded);
        assert_eq!(counts(0, 0, 2).phase(), Phase::Failed);
        assert_eq!(counts(0, 0, 0).phase(), Phase::Pending);
    }

    #[test]
    fn not_found_serializes_without_error() {
        let value = serde_json::to_value(JobStatus::not_found()).unwrap();
        assert_eq!(
            value,
            json!({ "status": "NotFound", "exists": false, "isRunning": false })
        );
    }

    #[test]
    fn unknown_does_not_claim_absence() {
        let value = serde_json::to_value(JobStatus::unknown("refused".into())).unwrap();
        assert_eq!(
            value,
            json!({ "status": "Unknown", "exists": null, "isRunning": false, "error": "refused" })
        );
    }

    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn running_job() {
        let server = MockServer::start_async().await;
        mock_job(&server, "backup-database", json!({ "active": 1 })).await;
        let cred = ClusterCredential::external(server.base_url(), "t");

        let status = status(&cred, "backup-database", &ns(), TIMEOUT).await;
        assert_eq!(status.status, Phase::Running);
        assert_eq!(status.exists, Some(true));
        assert!(status.is_running);
        assert_eq!(
            status.details,
            Some(Counts {
                active: 1,
                succeeded: 0,
                failed: 0
            })
        );
        assert_eq!(status.error, None);
    }

    #[tokio::test]
    async fn missing_job_is_not_an_error() {
        let server = MockServer::start_async().await;
        mock_missing(&server, "never-submitted").await;
        let cred = ClusterCredential::external(server.base_url(), "t");

        let status = status(&cred, "never-submitted", &ns(), TIMEOUT).await;
        assert_eq!(status, JobStatus::not_found());
    }

    #[tokio::test]
    async fn transport_failures_are_captured() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/apis/batch/v1/namespaces/jobshot/jobs/broken");
                then.status(500).json_body(json!({
                    "kind": "Status", "apiVersion": "v1", "metadata": {},
                    "status": "Failure", "message": "etcd unavailable",
                    "reason": "InternalError", "code": 500
                }));
            })
            .await;
        let cred = ClusterCredential::external(server.base_url(), "t");

        let status = status(&cred, "broken", &ns(), TIMEOUT).await;
        assert_eq!(status.status, Phase::Unknown);
        assert_eq!(status.exists, None);
        assert!(status.error.unwrap().contains("etcd unavailable"));
    }

    #[tokio::test]
    async fn batch_keeps_request_order() {
        let server = MockServer::start_async().await;
        mock_job(&server, "done", json!({ "succeeded": 1 })).await;
        mock_missing(&server, "gone").await;
        let cred = ClusterCredential::external(server.base_url(), "t");

        let names = vec!["gone".to_string(), "done".to_string()];
        let batch = status_many(&cred, &names, &ns(), TIMEOUT).await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].name, "gone");
        assert_eq!(batch[0].status.exists, Some(false));
        assert_eq!(batch[1].name, "done");
        assert_eq!(batch[1].status.status, Phase::Succeeded);
    }

    #[tokio::test]
    async fn refused_primary_falls_through_to_the_alternate() {
        let server = MockServer::start_async().await;
        mock_job(&server, "backup-database", json!({ "active": 1 })).await;
        let mut cred = ClusterCredential::external(closed_port_url(), "t");
        cred.alternate_endpoints = vec![server.base_url()];

        let status = status(&cred, "backup-database", &ns(), TIMEOUT).await;
        assert_eq!(status.error, None);
        assert_eq!(status.status, Phase::Running);
        assert_eq!(status.exists, Some(true));
    }

    #[tokio::test]
    async fn every_endpoint_refused_is_unknown() {
        let mut cred = ClusterCredential::external(closed_port_url(), "t");
        cred.alternate_endpoints = vec![closed_port_url()];

        let names = vec!["a".to_string(), "b".to_string()];
        let batch = status_many(&cred, &names, &ns(), TIMEOUT).await;
        assert_eq!(batch.len(), 2);
        for entry in batch {
            assert_eq!(entry.status.status, Phase::Unknown);
            assert_eq!(entry.status.exists, None);
            assert!(entry.status.error.is_some());
        }
    }

    #[tokio::test]
    async fn missing_parameter_on_get_retries_with_the_request_convention() {
        let server = MockServer::start_async().await;
        let get = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/apis/batch/v1/namespaces/jobshot/jobs/flaky");
                then.status(400).json_body(json!({
                    "kind": "Status", "apiVersion": "v1", "metadata": {},
                    "status": "Failure",
                    "message": "Required parameter name was null or undefined",
                    "reason": "BadRequest", "code": 400
                }));
            })
            .await;
        let cred = ClusterCredential::external(server.base_url(), "t");

        let status = status(&cred, "flaky", &ns(), TIMEOUT).await;
        assert_eq!(status.status, Phase::Unknown);
        get.assert_hits_async(2).await;
    }
}
