use std::{
    fmt::{Debug, Display, Formatter},
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Parser, ValueEnum};

use crate::credential::{DEFAULT_CA_PATH, DEFAULT_TOKEN_PATH};

#[derive(Parser, Debug, Clone)]
#[clap(name = "jobshot", about = "Launch predefined one-shot Kubernetes Jobs from a web UI")]
pub struct Opts {
    /// Address the HTTP server listens on.
    #[clap(long, env = "JOBSHOT_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Path to the YAML job catalog.
    #[clap(short, long, env = "JOBSHOT_CATALOG", default_value = "jobs.yaml")]
    pub catalog: PathBuf,

    /// Directory holding the built UI bundle.
    #[clap(long, env = "JOBSHOT_STATIC_DIR", default_value = "public")]
    pub static_dir: PathBuf,

    /// What to do when a request names no namespace and the catalog entry doesn't either.
    #[clap(long, env = "JOBSHOT_NAMESPACE_POLICY", value_enum, default_value = "strict")]
    pub namespace_policy: PolicyKind,

    /// Namespace used by the `fallback` policy.
    #[clap(long, env = "JOBSHOT_DEFAULT_NAMESPACE", default_value = "default")]
    pub default_namespace: Namespace,

    /// Upper bound on any single call to the Kubernetes API.
    #[clap(long, env = "JOBSHOT_CLUSTER_TIMEOUT_SECS", default_value = "5")]
    pub cluster_timeout_secs: u64,

    /// Mounted service-account token, used in in-cluster mode.
    #[clap(long, env = "JOBSHOT_TOKEN_PATH", default_value = DEFAULT_TOKEN_PATH)]
    pub token_path: PathBuf,

    /// Mounted service-account CA bundle, used in in-cluster mode.
    #[clap(long, env = "JOBSHOT_CA_PATH", default_value = DEFAULT_CA_PATH)]
    pub ca_path: PathBuf,
}

impl Opts {
    pub fn namespace_policy(&self) -> NamespacePolicy {
        match self.namespace_policy {
            PolicyKind::Strict => NamespacePolicy::Strict,
            PolicyKind::Fallback => NamespacePolicy::Fallback(self.default_namespace.clone()),
        }
    }

    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_timeout_secs)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Strict,
    Fallback,
}

/// How a missing namespace is treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespacePolicy {
    /// Reject the request.
    Strict,
    /// Use the given namespace.
    Fallback(Namespace),
}

impl NamespacePolicy {
    /// Picks the first namespace present, in order: request, catalog entry, policy.
    pub fn resolve(
        &self,
        requested: Option<&str>,
        catalog: Option<&str>,
    ) -> anyhow::Result<Namespace> {
        let given = [requested, catalog]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty());
        match (given, self) {
            (Some(ns), _) => ns.parse(),
            (None, NamespacePolicy::Fallback(ns)) => Ok(ns.clone()),
            (None, NamespacePolicy::Strict) => Err(anyhow::anyhow!(
                "namespace is required: set it on the request or on the catalog entry"
            )),
        }
    }
}

/// Valid custom namespaces:
///   must not be empty, use "default" instead
///   contain at most 63 characters
///   contain only lowercase alphanumeric characters or '-'
///   start with an alphanumeric character
///   end with an alphanumeric character
#[derive(Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for Namespace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(!s.is_empty(), "namespace cannot be an empty string");
        anyhow::ensure!(s.len() <= 63, "namespace must be <= 63 characters");
        anyhow::ensure!(
            s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
            "namespace must contain only lowercase alphanumeric characters or '-'"
        );
        anyhow::ensure!(
            s.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()),
            "namespace must start with an alphanumeric character"
        );
        anyhow::ensure!(
            s.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()),
            "namespace must end with an alphanumeric character"
        );
        Ok(Self(s.to_string()))
    }
}

impl Debug for Namespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
