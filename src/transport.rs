use std::{
    error::Error as StdError,
    fmt::{Display, Formatter},
    io::ErrorKind,
    time::Duration,
};

use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{config::Namespace, credential::ClusterCredential, error::ClientError};

const BODY_EXCERPT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    Verify,
    SkipVerify,
}

impl TlsMode {
    /// The mode used when nothing has been probed yet.
    pub fn for_credential(credential: &ClusterCredential) -> Self {
        if credential.skip_tls_verify {
            TlsMode::SkipVerify
        } else {
            TlsMode::Verify
        }
    }
}

impl Display for TlsMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsMode::Verify => f.write_str("tls verified"),
            TlsMode::SkipVerify => f.write_str("tls unverified"),
        }
    }
}

/// An endpoint together with the TLS mode that reaches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterTarget {
    pub endpoint: String,
    pub tls: TlsMode,
}

impl ClusterTarget {
    pub fn new(endpoint: &str, tls: TlsMode) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            tls,
        }
    }

    pub fn primary(credential: &ClusterCredential) -> Option<Self> {
        credential
            .endpoint
            .as_deref()
            .map(|endpoint| Self::new(endpoint, TlsMode::for_credential(credential)))
    }
}

impl Display for ClusterTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.endpoint, self.tls)
    }
}

pub fn http_client(
    credential: &ClusterCredential,
    tls: TlsMode,
    timeout: Duration,
) -> Result<reqwest::Client, ClientError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Some(token) = &credential.token {
        let mut value =
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| ClientError::Token)?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(timeout)
        .timeout(timeout);
    builder = match tls {
        TlsMode::Verify => match &credential.ca_bundle {
            Some(pem) => builder.add_root_certificate(
                reqwest::Certificate::from_pem(pem).map_err(ClientError::CaBundle)?,
            ),
            None => builder,
        },
        TlsMode::SkipVerify => builder.danger_accept_invalid_certs(true),
    };
    builder.build().map_err(ClientError::Http)
}

pub async fn kube_client(
    credential: &ClusterCredential,
    target: &ClusterTarget,
    timeout: Duration,
) -> Result<kube::Client, ClientError> {
    let mut cluster = json!({ "server": target.endpoint });
    match (target.tls, &credential.ca_bundle) {
        (TlsMode::SkipVerify, _) => cluster["insecure-skip-tls-verify"] = json!(true),
        (TlsMode::Verify, Some(pem)) => {
            cluster["certificate-authority-data"] =
                json!(base64::engine::general_purpose::STANDARD.encode(pem))
        }
        (TlsMode::Verify, None) => {}
    }
    let mut user = json!({});
    if let Some(token) = &credential.token {
        user["token"] = json!(token);
    }

    let kubeconfig: Kubeconfig = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "jobshot", "cluster": cluster }],
        "users": [{ "name": "jobshot", "user": user }],
        "contexts": [{ "name": "jobshot", "context": { "cluster": "jobshot", "user": "jobshot" } }],
        "current-context": "jobshot",
    }))
    .map_err(|e| ClientError::Kubeconfig(e.to_string()))?;

    let mut config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClientError::Kubeconfig(e.to_string()))?;
    config.connect_timeout = Some(timeout);
    config.read_timeout = Some(timeout);
    Ok(kube::Client::try_from(config)?)
}

/// Why a direct read did not produce a pod list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectFailure {
    /// Refused, unreachable, reset or timed out.
    Network(String),
    /// The server certificate could not be verified.
    Tls(String),
    /// 401 or 403.
    Denied { status: u16, body: String },
    /// Any other non-2xx.
    Status { status: u16, body: String },
    /// 2xx, but not a pod list.
    Malformed(String),
    /// The client could not be built or the request could not be sent for a local reason.
    Client(String),
}

impl Display for DirectFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectFailure::Network(e) => write!(f, "unreachable: {e}"),
            DirectFailure::Tls(e) => write!(f, "tls trust failure: {e}"),
            DirectFailure::Denied { status, body } => {
                write!(f, "permission denied (HTTP {status}): {body}")
            }
            DirectFailure::Status { status, body } => write!(f, "HTTP {status}: {body}"),
            DirectFailure::Malformed(e) => write!(f, "unexpected response: {e}"),
            DirectFailure::Client(e) => write!(f, "client error: {e}"),
        }
    }
}

#[derive(Deserialize)]
struct PodListShape {
    #[serde(default)]
    kind: Option<String>,
    items: Vec<serde_json::Value>,
}

/// `GET /api/v1/namespaces/{ns}/pods?limit=1`. Returns how many pods came back.
pub async fn list_pods(
    client: &reqwest::Client,
    endpoint: &str,
    namespace: &Namespace,
) -> Result<usize, DirectFailure> {
    let url = format!(
        "{}/api/v1/namespaces/{}/pods",
        endpoint.trim_end_matches('/'),
        namespace
    );
    let response = client
        .get(&url)
        .query(&[("limit", "1")])
        .send()
        .await
        .map_err(|e| classify(&e))?;
    let status = response.status();
    let body = response.text().await.map_err(|e| classify(&e))?;

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(DirectFailure::Denied {
            status: status.as_u16(),
            body: excerpt(&body),
        });
    }
    if !status.is_success() {
        return Err(DirectFailure::Status {
            status: status.as_u16(),
            body: excerpt(&body),
        });
    }

    let list: PodListShape = serde_json::from_str(&body)
        .map_err(|e| DirectFailure::Malformed(format!("{e}: {}", excerpt(&body))))?;
    match list.kind.as_deref() {
        None | Some("PodList") => Ok(list.items.len()),
        Some(other) => Err(DirectFailure::Malformed(format!(
            "expected a PodList, got {other}"
        ))),
    }
}

/// Sorts a failed direct read. Only the `source()` chain is inspected: the top-level message
/// carries the request URL, and a host or namespace must not change the verdict.
pub fn classify(err: &reqwest::Error) -> DirectFailure {
    let sources = sources(err);
    let detail = sources
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ");
    let detail = if detail.is_empty() {
        err.to_string()
    } else {
        detail
    };

    let io_kinds: Vec<ErrorKind> = sources
        .iter()
        .filter_map(|e| e.downcast_ref::<std::io::Error>())
        .map(std::io::Error::kind)
        .collect();
    if io_kinds.iter().any(|kind| is_network_kind(*kind)) || err.is_timeout() {
        DirectFailure::Network(detail)
    } else if io_kinds.contains(&ErrorKind::InvalidData) || looks_like_tls(&detail) {
        // rustls surfaces handshake and certificate failures as InvalidData
        DirectFailure::Tls(detail)
    } else if err.is_connect() || err.is_request() || err.is_body() || looks_like_network(&detail)
    {
        DirectFailure::Network(detail)
    } else {
        DirectFailure::Client(detail)
    }
}

fn sources<'a>(err: &'a (dyn StdError + 'static)) -> Vec<&'a (dyn StdError + 'static)> {
    let mut out = Vec::new();
    let mut source = err.source();
    while let Some(e) = source {
        out.push(e);
        source = e.source();
    }
    out
}

fn is_network_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof
    )
}

/// Whether a structured call failed before reaching any API server.
pub fn is_unreachable(err: &kube::Error) -> bool {
    matches!(err, kube::Error::HyperError(_) | kube::Error::Service(_))
}

pub(crate) fn looks_like_tls(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "certificate",
        "unknownissuer",
        "self signed",
        "self-signed",
        "x509",
        "handshake",
        "tls",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

fn looks_like_network(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "connection refused",
        "connection reset",
        "timed out",
        "unreachable",
        "dns error",
        "broken pipe",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

pub(crate) fn excerpt(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(BODY_EXCERPT) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}
