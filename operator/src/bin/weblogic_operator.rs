//! Operator entry point: watches the configured namespaces for Domain
//! resources, serves health endpoints, and shuts down cleanly on
//! SIGINT/SIGTERM.

use axum::{routing::get, Json, Router};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use operator::watchers::start_watchers;
use operator::{DomainProcessor, KubeFacade, OperatorDelegate, TuningParameters};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const OPERATOR_CONFIG_MAP: &str = "weblogic-operator-cm";
const TUNING_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,operator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting WebLogic operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let operator_namespace =
        std::env::var("OPERATOR_NAMESPACE").unwrap_or_else(|_| "weblogic-operator".to_string());
    let target_namespaces: Vec<String> = std::env::var("OPERATOR_TARGET_NAMESPACES")
        .unwrap_or_else(|_| operator_namespace.clone())
        .split(',')
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
        .collect();

    let tuning = Arc::new(TuningParameters::default());
    reload_tuning(&client, &operator_namespace, &tuning).await;

    let facade = Arc::new(KubeFacade::new(client.clone()));
    let delegate = OperatorDelegate::new(facade, tuning.clone());
    let processor = DomainProcessor::new(delegate.clone());

    let mut watcher_handles = Vec::new();
    for namespace in &target_namespaces {
        info!(namespace, "managing namespace");
        delegate.start_namespace(namespace);
        watcher_handles.extend(start_watchers(&processor, &client, namespace));
    }

    // Keep the tuning snapshot current with the operator ConfigMap and
    // surface any fibers stuck at a suspension point.
    let tuning_task = {
        let client = client.clone();
        let namespace = operator_namespace.clone();
        let tuning = tuning.clone();
        let processor = processor.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TUNING_RELOAD_INTERVAL);
            loop {
                interval.tick().await;
                reload_tuning(&client, &namespace, &tuning).await;
                processor.report_suspended_fibers();
            }
        })
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        );

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("Operator HTTP server listening on 0.0.0.0:8080");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down: stopping managed namespaces");
    for namespace in &target_namespaces {
        processor.stop_namespace(namespace);
        delegate.stop_namespace(namespace);
    }
    tuning_task.abort();
    for handle in watcher_handles {
        handle.abort();
    }
    info!("Operator stopped");
    Ok(())
}

async fn reload_tuning(client: &kube::Client, namespace: &str, tuning: &TuningParameters) {
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    match config_maps.get_opt(OPERATOR_CONFIG_MAP).await {
        Ok(Some(config_map)) => tuning.update_from_config_map(&config_map),
        Ok(None) => {}
        Err(error) => warn!(%error, "failed to read operator ConfigMap"),
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "weblogic-operator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "weblogic-operator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
