use std::process;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gangway::cli::Args;
use gangway::cluster::ClusterClient;
use gangway::config::Settings;
use gangway::server::{create_router, AppState};

#[tokio::main]
async fn main() {
    let mut args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified, then re-read flags so variables from the
    // file take effect.
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
        args = Args::parse();
    }

    let settings = Settings::from_args(&args);

    let kube_client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to connect to the cluster: {}", e);
            process::exit(1);
        }
    };
    let cluster = ClusterClient::new(kube_client);

    info!(
        edge_api_url = %settings.edge_api_url,
        routing_kvm = settings.routing_kvm_enabled,
        sync_hosts = settings.sync_hosts_enabled,
        isolate_namespaces = settings.isolate_namespaces,
        "configuration loaded"
    );

    let state = AppState::new(settings, cluster);
    let addr = format!("{}:{}", args.bind_addr, args.port);

    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
