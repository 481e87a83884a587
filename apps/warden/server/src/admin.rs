use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use warden_server::{ControlServer, InstanceSnapshot};

struct AdminState {
    server: ControlServer,
    metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct InstancesResponse {
    active_instances: usize,
    connected_instances: usize,
    instances: Vec<InstanceSnapshot>,
}

/// Operator endpoints, served apart from the control channel listener.
pub fn router(server: ControlServer, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/instances", get(instances_handler))
        .with_state(Arc::new(AdminState { server, metrics }))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn instances_handler(State(state): State<Arc<AdminState>>) -> Json<InstancesResponse> {
    let instances = state.server.instances();
    Json(InstancesResponse {
        active_instances: instances.len(),
        connected_instances: instances.iter().filter(|i| i.connected).count(),
        instances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use warden_server::{ControlServerConfig, Lifecycle};

    #[tokio::test]
    async fn lists_registered_instances() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControlServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            dir.path().to_path_buf(),
            dir.path().join("runtime"),
        );
        let server = ControlServer::bind(config, CancellationToken::new())
            .await
            .unwrap();
        let instance = server.register_instance("reports");
        let state = Arc::new(AdminState {
            server,
            metrics: None,
        });

        let Json(body) = instances_handler(State(state)).await;
        assert_eq!(body.active_instances, 1);
        assert_eq!(body.connected_instances, 0);
        assert_eq!(body.instances[0].id, instance.id());
        assert_eq!(body.instances[0].service, "reports");
        assert_eq!(body.instances[0].lifecycle, Lifecycle::Running);
    }
}
