use std::{
    fmt::{Debug, Formatter},
    path::{Path, PathBuf},
};

use serde::Serialize;
use tracing::{debug, warn};

pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const DEFAULT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

pub const API_URL_VAR: &str = "K8S_API_URL";
pub const TOKEN_VAR: &str = "K8S_TOKEN";
pub const CA_PATH_VAR: &str = "K8S_CA_PATH";
pub const SKIP_TLS_VERIFY_VAR: &str = "K8S_SKIP_TLS_VERIFY";
pub const PREFER_IN_CLUSTER_VAR: &str = "K8S_PREFER_IN_CLUSTER";
pub const SERVICE_HOST_VAR: &str = "KUBERNETES_SERVICE_HOST";
pub const SERVICE_PORT_VAR: &str = "KUBERNETES_SERVICE_PORT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    External,
    InCluster,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ClusterCredential {
    pub mode: Mode,
    /// Primary API server base URL.
    pub endpoint: Option<String>,
    /// Further candidates, tried in order after `endpoint`.
    pub alternate_endpoints: Vec<String>,
    pub token: Option<String>,
    /// PEM encoded trust anchors.
    pub ca_bundle: Option<Vec<u8>>,
    /// Operator opted in to retrying with certificate verification disabled.
    pub skip_tls_verify: bool,
}

impl ClusterCredential {
    pub fn external(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            mode: Mode::External,
            endpoint: Some(endpoint.into()),
            alternate_endpoints: Vec::new(),
            token: Some(token.into()),
            ca_bundle: None,
            skip_tls_verify: true,
        }
    }

    /// All endpoints worth trying, primary first.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        self.endpoint
            .iter()
            .chain(self.alternate_endpoints.iter())
            .map(String::as_str)
    }
}

impl Debug for ClusterCredential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCredential")
            .field("mode", &self.mode)
            .field("endpoint", &self.endpoint)
            .field("alternate_endpoints", &self.alternate_endpoints)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("ca_bundle", &self.ca_bundle.as_ref().map(Vec::len))
            .field("skip_tls_verify", &self.skip_tls_verify)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MountPaths {
    pub token: PathBuf,
    pub ca: PathBuf,
}

impl Default for MountPaths {
    fn default() -> Self {
        Self {
            token: DEFAULT_TOKEN_PATH.into(),
            ca: DEFAULT_CA_PATH.into(),
        }
    }
}

/// Where request handlers get their credential from.
pub trait CredentialSource: Send + Sync {
    fn resolve(&self) -> ClusterCredential;
}

/// Reads the process environment and the mounted service-account files on every call.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    pub mounts: MountPaths,
}

impl CredentialSource for EnvCredentials {
    fn resolve(&self) -> ClusterCredential {
        resolve(|key| std::env::var(key).ok(), &self.mounts)
    }
}

/// A fixed credential, for tests and for embedding.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub ClusterCredential);

impl CredentialSource for StaticCredentials {
    fn resolve(&self) -> ClusterCredential {
        self.0.clone()
    }
}

/// Runs on every request and caches nothing, since the kubelet rotates mounted tokens.
pub fn resolve(lookup: impl Fn(&str) -> Option<String>, mounts: &MountPaths) -> ClusterCredential {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let in_cluster_endpoint = var(SERVICE_HOST_VAR).map(|host| {
        let port = var(SERVICE_PORT_VAR).unwrap_or_else(|| "443".to_string());
        service_url(host.trim(), port.trim())
    });
    let skip_tls_verify = var(SKIP_TLS_VERIFY_VAR).and_then(|v| parse_flag(SKIP_TLS_VERIFY_VAR, &v));

    if let (Some(endpoint), Some(token)) = (var(API_URL_VAR), var(TOKEN_VAR)) {
        let prefer_in_cluster = var(PREFER_IN_CLUSTER_VAR)
            .and_then(|v| parse_flag(PREFER_IN_CLUSTER_VAR, &v))
            .unwrap_or(false);
        let explicit = endpoint.trim().trim_end_matches('/').to_string();
        let (endpoint, alternate_endpoints) = match in_cluster_endpoint {
            Some(derived) if derived != explicit && prefer_in_cluster => (derived, vec![explicit]),
            Some(derived) if derived != explicit => (explicit, vec![derived]),
            _ => (explicit, Vec::new()),
        };
        debug!(%endpoint, ?alternate_endpoints, "using external credentials");
        return ClusterCredential {
            mode: Mode::External,
            endpoint: Some(endpoint),
            alternate_endpoints,
            token: Some(token.trim().to_string()),
            ca_bundle: var(CA_PATH_VAR).and_then(|path| read_mount(Path::new(path.trim()))),
            // self-managed clusters commonly run private CAs
            skip_tls_verify: skip_tls_verify.unwrap_or(true),
        };
    }

    let token = read_mount(&mounts.token).and_then(|bytes| {
        let token = String::from_utf8_lossy(&bytes).trim().to_string();
        (!token.is_empty()).then_some(token)
    });
    let ca_bundle = read_mount(&mounts.ca);
    debug!(
        endpoint = ?in_cluster_endpoint,
        has_token = token.is_some(),
        has_ca = ca_bundle.is_some(),
        "using in-cluster credentials"
    );
    ClusterCredential {
        mode: Mode::InCluster,
        endpoint: in_cluster_endpoint,
        alternate_endpoints: Vec::new(),
        token,
        ca_bundle,
        skip_tls_verify: skip_tls_verify.unwrap_or(false),
    }
}

fn service_url(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("https://[{host}]:{port}")
    } else {
        format!("https://{host}:{port}")
    }
}

fn read_mount(path: &Path) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "mounted secret not readable");
            None
        }
    }
}

fn parse_flag(name: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!(var = name, value = other, "ignoring unrecognized boolean");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn missing_mounts() -> MountPaths {
        MountPaths {
            token: "/nonexistent/jobshot/token".into(),
            ca: "/nonexistent/jobshot/ca.crt".into(),
        }
    }

    #[test]
    fn explicit_endpoint_and_token_select_external_mode() {
        let cred = resolve(
            env(&[(API_URL_VAR, "https://k8s.example:6443/"), (TOKEN_VAR, "abc")]),
            &missing_mounts(),
        );
        assert_eq!(cred.mode, Mode::External);
        assert_eq!(cred.endpoint.as_deref(), Some("https://k8s.example:6443"));
        assert_eq!(cred.token.as_deref(), Some("abc"));
        assert!(cred.skip_tls_verify);
        assert!(cred.alternate_endpoints.is_empty());
    }

    #[test]
    fn external_mode_can_require_verification() {
        let cred = resolve(
            env(&[
                (API_URL_VAR, "https://k8s.example"),
                (TOKEN_VAR, "abc"),
                (SKIP_TLS_VERIFY_VAR, "false"),
            ]),
            &missing_mounts(),
        );
        assert!(!cred.skip_tls_verify);
    }

    #[test]
    fn endpoint_without_token_falls_back_to_in_cluster() {
        let cred = resolve(
            env(&[
                (API_URL_VAR, "https://k8s.example"),
                (SERVICE_HOST_VAR, "10.0.0.1"),
            ]),
            &missing_mounts(),
        );
        assert_eq!(cred.mode, Mode::InCluster);
        assert_eq!(cred.endpoint.as_deref(), Some("https://10.0.0.1:443"));
        assert_eq!(cred.token, None);
        assert_eq!(cred.ca_bundle, None);
        assert!(!cred.skip_tls_verify);
    }

    #[test]
    fn external_mode_reads_a_ca_bundle_when_given() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("cluster-ca.pem");
        std::fs::write(&ca, "-----BEGIN CERTIFICATE-----\n").unwrap();
        let ca = ca.to_string_lossy().to_string();

        let cred = resolve(
            env(&[
                (API_URL_VAR, "https://k8s.example:6443"),
                (TOKEN_VAR, "abc"),
                (CA_PATH_VAR, ca.as_str()),
            ]),
            &missing_mounts(),
        );
        assert_eq!(cred.mode, Mode::External);
        assert_eq!(
            cred.ca_bundle.as_deref(),
            Some(&b"-----BEGIN CERTIFICATE-----\n"[..])
        );

        let unreadable = resolve(
            env(&[
                (API_URL_VAR, "https://k8s.example:6443"),
                (TOKEN_VAR, "abc"),
                (CA_PATH_VAR, "/nonexistent/ca.pem"),
            ]),
            &missing_mounts(),
        );
        assert_eq!(unreadable.ca_bundle, None);
    }

    #[test]
    fn in_cluster_reads_mounted_files() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = MountPaths {
            token: dir.path().join("token"),
            ca: dir.path().join("ca.crt"),
        };
        std::fs::write(&mounts.token, "sa-token\n").unwrap();
        std::fs::write(&mounts.ca, "-----BEGIN CERTIFICATE-----\n").unwrap();

        let cred = resolve(
            env(&[(SERVICE_HOST_VAR, "fd00::1"), (SERVICE_PORT_VAR, "8443")]),
            &mounts,
        );
        assert_eq!(cred.mode, Mode::InCluster);
        assert_eq!(cred.endpoint.as_deref(), Some("https://[fd00::1]:8443"));
        assert_eq!(cred.token.as_deref(), Some("sa-token"));
        assert_eq!(
            cred.ca_bundle.as_deref(),
            Some(&b"-----BEGIN CERTIFICATE-----\n"[..])
        );
    }

    #[test]
    fn nothing_configured_yields_no_endpoint() {
        let cred = resolve(env(&[]), &missing_mounts());
        assert_eq!(cred.mode, Mode::InCluster);
        assert_eq!(cred.candidates().count(), 0);
    }

    #[test]
    fn in_cluster_endpoint_is_an_alternate_candidate() {
        let vars = [
            (API_URL_VAR, "https://k8s.example"),
            (TOKEN_VAR, "abc"),
            (SERVICE_HOST_VAR, "10.0.0.1"),
        ];
        let cred = resolve(env(&vars), &missing_mounts());
        assert_eq!(
            cred.candidates().collect::<Vec<_>>(),
            ["https://k8s.example", "https://10.0.0.1:443"]
        );

        let mut preferred = vars.to_vec();
        preferred.push((PREFER_IN_CLUSTER_VAR, "true"));
        let cred = resolve(env(&preferred), &missing_mounts());
        assert_eq!(
            cred.candidates().collect::<Vec<_>>(),
            ["https://10.0.0.1:443", "https://k8s.example"]
        );
    }

    #[test]
    fn debug_output_hides_the_token() {
        let cred = ClusterCredential::external("https://k8s.example", "super-secret-token");
        let printed = format!("{cred:?}");
        assert!(!printed.contains("super-secret-token"));
        assert!(printed.contains("<redacted>"));
    }
}
