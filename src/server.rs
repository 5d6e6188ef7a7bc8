use std::{path::Path, sync::Arc, time::Duration};

use axum::{
    extract::{rejection::JsonRejection, Path as UrlPath, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::{
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    catalog::Catalog,
    common::JobDefinition,
    config::{Namespace, NamespacePolicy},
    credential::CredentialSource,
    error::{RunJobError, ValidationError},
    manifest,
    probe::{self, PreflightResult},
    status::{self, JobStatus, NamedStatus},
    submit,
};

/// Shared, read-only state behind every handler.
pub struct AppState {
    pub catalog: Catalog,
    pub credentials: Arc<dyn CredentialSource>,
    pub namespace_policy: NamespacePolicy,
    /// Bound on each individual cluster call.
    pub cluster_timeout: Duration,
}

impl AppState {
    fn namespace(
        &self,
        requested: Option<&str>,
        catalog: Option<&str>,
    ) -> Result<Namespace, ValidationError> {
        self.namespace_policy
            .resolve(requested, catalog)
            .map_err(|e| ValidationError::Namespace(format!("{e:#}")))
    }
}

/// API routes plus, when `static_dir` is given, the UI bundle for every other path.
pub fn router(state: Arc<AppState>, static_dir: Option<&Path>) -> Router {
    let router = Router::new()
        .route("/healthz", get(health))
        .route("/api/jobs", get(list_jobs))
        .route("/api/run-job", post(run_job))
        .route("/api/job-status", get(job_status_batch))
        .route("/api/job-status/:name", get(job_status))
        .route("/api/preflight", get(preflight))
        .with_state(state);

    let router = match static_dir {
        Some(dir) => router.fallback_service(
            ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html"))),
        ),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobDefinition>> {
    Json(state.catalog.jobs.clone())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Launched {
    pub message: String,
    pub job_name: String,
    pub namespace: String,
}

async fn run_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JobDefinition>, JsonRejection>,
) -> Result<Json<Launched>, RunJobError> {
    let Json(mut definition) = body.map_err(|e| ValidationError::Body(e.body_text()))?;
    definition.validate()?;

    let entry = state
        .catalog
        .get(&definition.name)
        .ok_or_else(|| ValidationError::UnknownJob(definition.name.clone()))?;
    // the command never comes from the browser
    definition.entrypoint = entry.entrypoint.clone();
    if definition.resources.is_none() {
        definition.resources = entry.resources.clone();
    }
    let namespace = state.namespace(definition.namespace.as_deref(), entry.namespace.as_deref())?;

    let credential = state.credentials.resolve();
    let preflight = probe::probe(&credential, &namespace, state.cluster_timeout).await;
    let target = match preflight {
        PreflightResult {
            ok: true,
            target: Some(target),
            ..
        } => target,
        failed => return Err(RunJobError::Preflight(failed.detail)),
    };

    let rendered = manifest::build(&definition, &namespace);
    let job_name = submit::submit(&credential, &target, &rendered, state.cluster_timeout).await?;
    info!(job = %job_name, %namespace, image = %definition.container, "job launched");

    Ok(Json(Launched {
        message: format!("job {job_name} created in namespace {namespace}"),
        job_name,
        namespace: namespace.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct NamespaceQuery {
    namespace: Option<String>,
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Json<JobStatus>, ValidationError> {
    let entry = state.catalog.by_job_name(&name);
    let namespace = state.namespace(
        query.namespace.as_deref(),
        entry.and_then(|e| e.namespace.as_deref()),
    )?;
    let credential = state.credentials.resolve();
    Ok(Json(
        status::status(&credential, &name, &namespace, state.cluster_timeout).await,
    ))
}

#[derive(Debug, Deserialize)]
struct BatchQuery {
    #[serde(default)]
    names: String,
    namespace: Option<String>,
}

async fn job_status_batch(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BatchQuery>,
) -> Result<Json<Vec<NamedStatus>>, ValidationError> {
    let names: Vec<String> = query
        .names
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Ok(Json(Vec::new()));
    }
    // one namespace per batch; a catalog default only applies when every name agrees on it
    let catalog_namespaces: Vec<Option<&str>> = names
        .iter()
        .map(|n| {
            state
                .catalog
                .by_job_name(n)
                .and_then(|e| e.namespace.as_deref())
        })
        .collect();
    let shared = match catalog_namespaces.split_first() {
        Some((first, rest)) if rest.iter().all(|ns| ns == first) => *first,
        _ => None,
    };
    let namespace = state.namespace(query.namespace.as_deref(), shared)?;
    let credential = state.credentials.resolve();
    Ok(Json(
        status::status_many(&credential, &names, &namespace, state.cluster_timeout).await,
    ))
}

async fn preflight(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Json<PreflightResult>, ValidationError> {
    let namespace = state.namespace(query.namespace.as_deref(), None)?;
    let credential = state.credentials.resolve();
    Ok(Json(
        probe::probe(&credential, &namespace, state.cluster_timeout).await,
    ))
}
