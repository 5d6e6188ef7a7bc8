use std::time::Duration;

use futures::{future::BoxFuture, FutureExt};
use k8s_openapi::api::batch::v1::Job;
use kube::{api::PostParams, core::Request, Api, Client};
use tracing::{info, warn};

use crate::{
    convention::{self, ClusterCall, Convention},
    credential::ClusterCredential,
    error::SubmitError,
    manifest::RenderedJob,
    transport::{self, ClusterTarget},
};

/// Creates the job at `target`, which should be the target preflight validated. Returns the job
/// name the UI polls with. Accepted means created, not scheduled.
pub async fn submit(
    credential: &ClusterCredential,
    target: &ClusterTarget,
    rendered: &RenderedJob,
    timeout: Duration,
) -> Result<String, SubmitError> {
    let client = transport::kube_client(credential, target, timeout).await?;
    let create = CreateJob { rendered };
    match convention::invoke(&create, &client, Convention::Scoped).await {
        Ok((_, convention)) => {
            info!(
                job = %rendered.name,
                namespace = %rendered.namespace,
                endpoint = %target.endpoint,
                %convention,
                "job created"
            );
            Ok(rendered.name.clone())
        }
        Err(e) => {
            let err = normalize(e, rendered);
            warn!(
                job = %rendered.name,
                namespace = %rendered.namespace,
                error = %err,
                "job creation failed"
            );
            Err(err)
        }
    }
}

fn normalize(err: kube::Error, rendered: &RenderedJob) -> SubmitError {
    match err {
        kube::Error::Api(response) => match response.code {
            409 => SubmitError::Conflict {
                name: rendered.name.clone(),
                namespace: rendered.namespace.to_string(),
                message: response.message,
            },
            401 | 403 => SubmitError::Forbidden {
                namespace: rendered.namespace.to_string(),
                message: response.message,
            },
            code => SubmitError::Rejected {
                code,
                message: response.message,
            },
        },
        other => SubmitError::Transport(other),
    }
}

struct CreateJob<'a> {
    rendered: &'a RenderedJob,
}

impl ClusterCall for CreateJob<'_> {
    type Output = Job;

    fn describe(&self) -> String {
        format!(
            "create job {} in {}",
            self.rendered.name, self.rendered.namespace
        )
    }

    fn call<'a>(
        &'a self,
        client: &'a Client,
        convention: Convention,
    ) -> BoxFuture<'a, kube::Result<Job>> {
        async move {
            let params = PostParams::default();
            let namespace = self.rendered.namespace.as_str();
            match convention {
                Convention::Scoped => {
                    Api::<Job>::namespaced(client.clone(), namespace)
                        .create(&params, &self.rendered.job)
                        .await
                }
                Convention::Request => {
                    let body =
                        serde_json::to_vec(&self.rendered.job).map_err(kube::Error::SerdeError)?;
                    let request = Request::new(format!("/apis/batch/v1/namespaces/{namespace}/jobs"))
                        .create(&params, body)
                        .map_err(kube::Error::BuildRequest)?;
                    client.request(request).await
                }
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
    use crate::{common::JobDefinition, manifest, transport::TlsMode};

    fn rendered() -> RenderedJob {
        let def = JobDefinition {
            name: "Backup Database".into(),
            description: None,
            container: "backup-db:latest".into(),
            entrypoint: Some(vec!["/bin/sh".into(), "-c".into()]),
            parameters: vec!["./backup.sh --db=main".into()],
            namespace: None,
            resources: None,
        };
        manifest::build(&def, &"jobshot".parse().unwrap())
    }

    fn status(code: u16, reason: &str, message: &str) -> serde_json::Value {
        json!({
            "kind": "Status", "apiVersion": "v1", "metadata": {},
            "status": "Failure", "message": message, "reason": reason, "code": code
        })
    }

    fn setup(server: &MockServer) -> (ClusterCredential, ClusterTarget) {
        let cred = ClusterCredential::external(server.base_url(), "test-token");
        let target = ClusterTarget::new(&server.base_url(), TlsMode::Verify);
        (cred, target)
    }

    #[tokio::test]
    async fn created_job_returns_its_slug() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/apis/batch/v1/namespaces/jobshot/jobs")
                    .header("authorization", "Bearer test-token")
                    .body_contains("\"name\":\"backup-database\"");
                then.status(201).json_body(json!({
                    "apiVersion": "batch/v1",
                    "kind": "Job",
                    "metadata": { "name": "backup-database", "namespace": "jobshot" }
                }));
            })
            .await;
        let (cred, target) = setup(&server);

        let name = submit(&cred, &target, &rendered(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(name, "backup-database");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict_and_not_retried() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST).path("/apis/batch/v1/namespaces/jobshot/jobs");
                then.status(409).json_body(status(
                    409,
                    "AlreadyExists",
                    "jobs.batch \"backup-database\" already exists",
                ));
            })
            .await;
        let (cred, target) = setup(&server);

        let err = submit(&cred, &target, &rendered(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Conflict { .. }), "{err}");
        assert!(err.to_string().contains("already exists"));
        create.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn forbidden_create_is_an_authorization_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/apis/batch/v1/namespaces/jobshot/jobs");
                then.status(403).json_body(status(
                    403,
                    "Forbidden",
                    "jobs.batch is forbidden: User \"system:serviceaccount:jobshot:ui\" cannot create resource \"jobs\"",
                ));
            })
            .await;
        let (cred, target) = setup(&server);

        let err = submit(&cred, &target, &rendered(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Forbidden { .. }), "{err}");
        assert!(err.to_string().starts_with("create jobs=denied (jobs.batch is forbidden"));
    }

    #[tokio::test]
    async fn missing_parameter_switches_convention_once() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST).path("/apis/batch/v1/namespaces/jobshot/jobs");
                then.status(400).json_body(status(
                    400,
                    "BadRequest",
                    "Required parameter body was null or undefined",
                ));
            })
            .await;
        let (cred, target) = setup(&server);

        let err = submit(&cred, &target, &rendered(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Rejected { code: 400, .. }), "{err}");
        create.assert_hits_async(2).await;
    }
}
