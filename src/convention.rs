use std::{
    fmt::{Display, Formatter},
    future::Future,
};

use futures::future::BoxFuture;
use kube::Client;
use serde::Serialize;
use tracing::debug;

/// `Scoped` goes through a typed `Api<K>` handle with the namespace bound in. `Request` builds the
/// call with `kube::core::Request` and hands it to `Client::request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Convention {
    Scoped,
    Request,
}

impl Convention {
    pub fn other(self) -> Self {
        match self {
            Convention::Scoped => Convention::Request,
            Convention::Request => Convention::Scoped,
        }
    }
}

impl Display for Convention {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Convention::Scoped => f.write_str("scoped"),
            Convention::Request => f.write_str("request"),
        }
    }
}

/// One cluster call, expressible in either convention.
pub trait ClusterCall: Sync {
    type Output: Send;

    /// Short description for logs, e.g. "list pods in jobshot".
    fn describe(&self) -> String;

    fn call<'a>(
        &'a self,
        client: &'a Client,
        convention: Convention,
    ) -> BoxFuture<'a, kube::Result<Self::Output>>;
}

/// Runs `call`, falling back to the other convention once on a missing-parameter failure.
/// Returns the output together with the convention that produced it.
pub async fn invoke<C: ClusterCall>(
    call: &C,
    client: &Client,
    preferred: Convention,
) -> kube::Result<(C::Output, Convention)> {
    debug!(call = %call.describe(), %preferred, "cluster call");
    with_fallback(preferred, |convention| call.call(client, convention)).await
}

pub async fn with_fallback<T, F, Fut>(
    preferred: Convention,
    mut attempt: F,
) -> kube::Result<(T, Convention)>
where
    F: FnMut(Convention) -> Fut,
    Fut: Future<Output = kube::Result<T>>,
{
    match attempt(preferred).await {
        Ok(out) => Ok((out, preferred)),
        Err(e) if is_missing_parameter(&e) => {
            let alternate = preferred.other();
            debug!(error = %e, %alternate, "call convention mismatch, retrying once");
            attempt(alternate).await.map(|out| (out, alternate))
        }
        Err(e) => Err(e),
    }
}

/// The signature of a call shaped for the wrong convention: the request could not be built
/// locally, or the server rejected it as missing a required parameter.
pub fn is_missing_parameter(err: &kube::Error) -> bool {
    match err {
        kube::Error::BuildRequest(_) => true,
        kube::Error::Api(response) => {
            matches!(response.code, 400 | 422)
                && response.message.to_ascii_lowercase().contains("required")
        }
        _ => false,
    }
}
