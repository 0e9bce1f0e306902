//! Entry point: wires the two cluster clients and runs the supervisor.

use std::collections::HashMap;

use anyhow::Context;
use clap::Parser;
use kube::client::ClientBuilder;
use kube::config::{
    AuthInfo, AuthProviderConfig, Cluster, KubeConfigOptions, Kubeconfig, NamedAuthInfo,
    NamedCluster, NamedContext,
};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cr_syncer::supervisor::Supervisor;
use cr_syncer::transport::{PrefixUriLayer, REMOTE_API_PREFIX};

/// OAuth scope requested for the remote cluster's bearer tokens.
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Syncs custom resources between the local cluster and a remote one.
#[derive(Parser, Debug)]
#[command(name = "cr-syncer", version, about, long_about = None)]
struct Cli {
    /// Remote Kubernetes server
    #[arg(long)]
    remote_server: String,

    /// Robot we are running on, can be used for selective syncing
    #[arg(long, default_value = "")]
    robot_name: String,

    /// Enable logging of every HTTP request on both clusters
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "info,cr_syncer=debug,kube_client=debug,tower_http=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install the default TLS crypto provider");
    }

    let local_config = Config::incluster_env().context("loading in-cluster configuration")?;
    let local =
        Client::try_from(local_config).context("creating client for the local cluster")?;

    let remote = remote_client(&cli.remote_server)
        .await
        .context("creating client for the remote cluster")?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    info!(remote_server = %cli.remote_server, robot_name = %cli.robot_name, "cr-syncer starting");
    Supervisor::new(local, remote, cli.robot_name)
        .run(token)
        .await?;

    info!("cr-syncer shut down cleanly");
    Ok(())
}

/// Build the client for the remote cluster: GCP application-default
/// credentials for auth, plus the gateway path prefix on every request.
///
/// An auth provider can only enter a `Config` through kubeconfig data, so
/// a minimal in-memory kubeconfig is assembled around the remote URL.
async fn remote_client(remote_server: &str) -> anyhow::Result<Client> {
    const CONTEXT: &str = "remote";

    let url = remote_cluster_url(remote_server)?;
    let kubeconfig = Kubeconfig {
        clusters: vec![NamedCluster {
            name: CONTEXT.to_string(),
            cluster: Some(Cluster {
                server: Some(url.to_string()),
                ..Default::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: CONTEXT.to_string(),
            auth_info: Some(AuthInfo {
                auth_provider: Some(AuthProviderConfig {
                    name: "gcp".to_string(),
                    config: HashMap::from([(
                        "scopes".to_string(),
                        CLOUD_PLATFORM_SCOPE.to_string(),
                    )]),
                }),
                ..Default::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: CONTEXT.to_string(),
            context: Some(kube::config::Context {
                cluster: CONTEXT.to_string(),
                user: Some(CONTEXT.to_string()),
                ..Default::default()
            }),
        }],
        current_context: Some(CONTEXT.to_string()),
        ..Default::default()
    };
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("assembling remote cluster configuration")?;

    let client = ClientBuilder::try_from(config)?
        .with_layer(&PrefixUriLayer::new(REMOTE_API_PREFIX))
        .build();
    Ok(client)
}

/// Normalize the remote server argument to an https URL.
fn remote_cluster_url(remote_server: &str) -> anyhow::Result<http::Uri> {
    anyhow::ensure!(!remote_server.is_empty(), "--remote-server must not be empty");
    let with_scheme = match remote_server.split_once("://") {
        None => format!("https://{remote_server}"),
        Some(("https", _)) => remote_server.to_string(),
        Some((_, rest)) => format!("https://{rest}"),
    };
    with_scheme
        .parse::<http::Uri>()
        .with_context(|| format!("invalid remote server {remote_server:?}"))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => {
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
