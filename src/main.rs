use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use jobshot::{
    catalog::Catalog,
    config::Opts,
    credential::{EnvCredentials, MountPaths},
    server::{self, AppState},
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

async fn inner_main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let catalog = if opts.catalog.exists() {
        Catalog::from_file(&opts.catalog)?
    } else {
        warn!(path = %opts.catalog.display(), "job catalog not found, serving an empty catalog");
        Catalog::default()
    };
    info!(jobs = catalog.jobs.len(), path = %opts.catalog.display(), "catalog loaded");

    let state = AppState {
        catalog,
        credentials: Arc::new(EnvCredentials {
            mounts: MountPaths {
                token: opts.token_path.clone(),
                ca: opts.ca_path.clone(),
            },
        }),
        namespace_policy: opts.namespace_policy(),
        cluster_timeout: opts.cluster_timeout(),
    };
    let static_dir = opts.static_dir.is_dir().then_some(opts.static_dir.as_path());
    if static_dir.is_none() {
        warn!(path = %opts.static_dir.display(), "static directory missing, UI will not be served");
    }
    let app = server::router(Arc::new(state), static_dir);

    let listener = TcpListener::bind(opts.bind)
        .await
        .with_context(|| format!("failed to bind {}", opts.bind))?;
    info!(addr = %opts.bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining connections");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = inner_main().await {
        error!("{:?}", e);
        std::process::exit(1);
    }
}
