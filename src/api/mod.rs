//! Read-only status API
mod base;
mod cluster;

use std::borrow::Cow;

use axum::{
    error_handling::HandleErrorLayer, http::StatusCode, response::IntoResponse, routing, Router,
};
use tokio::time::Duration;
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;

pub mod paths;

pub use base::AboutResponse;
pub use cluster::LeaderResponse;

use crate::node::ClusterHandle;

/// Build the status API over a running node
pub fn api(handle: ClusterHandle) -> Router {
    Router::new()
        .route(paths::base::ROOT, routing::get(base::root))
        .route(paths::base::HEALTH, routing::get(base::health))
        .route(paths::base::ABOUT, routing::get(base::about))
        .route(paths::cluster::STATUS, routing::get(cluster::status))
        .route(paths::cluster::LEADER, routing::get(cluster::leader))
        .layer(
            ServiceBuilder::new()
                // Handle errors from middleware
                .layer(HandleErrorLayer::new(handle_error))
                .load_shed()
                .timeout(Duration::from_secs(10)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

async fn handle_error(error: BoxError) -> impl IntoResponse {
    if error.is::<tower::timeout::error::Elapsed>() {
        return (StatusCode::REQUEST_TIMEOUT, Cow::from("request timed out"));
    }

    if error.is::<tower::load_shed::error::Overloaded>() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Cow::from("service is overloaded, try again later"),
        );
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Cow::from(format!("Unhandled internal error: {}", error)),
    )
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::body::{Body, HttpBody};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::node::{ClusterNode, ClusterStatus, NodeId};
    use crate::settings::Settings;
    use crate::transport::MemoryNetwork;

    fn lone_node() -> ClusterNode {
        let address: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let network = MemoryNetwork::new();
        let (transport, datagrams) = network.attach(address).unwrap();
        ClusterNode::spawn(
            Settings {
                port: address.port(),
                delay_ms: 100,
                timeout_ms: 300,
                ..Settings::default()
            },
            NodeId::generate(address),
            Arc::new(transport),
            datagrams,
        )
    }

    async fn get(router: Router, path: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let mut body = response.into_body();
        let mut bytes = Vec::new();
        while let Some(chunk) = body.data().await {
            bytes.extend_from_slice(&chunk.unwrap());
        }
        (status, bytes)
    }

    #[tokio::test]
    async fn test_base_routes() {
        let node = lone_node();
        let router = api(node.handle());

        let (status, body) = get(router.clone(), paths::base::HEALTH).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");

        let (status, body) = get(router.clone(), paths::base::ABOUT).await;
        assert_eq!(status, StatusCode::OK);
        let about: AboutResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(about, AboutResponse::default());

        let (status, _) = get(router, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_routes_report_lone_leader() {
        let node = lone_node();
        let local = node.local();
        let router = api(node.handle());

        let (status, body) = get(router.clone(), paths::cluster::LEADER).await;
        assert_eq!(status, StatusCode::OK);
        let leader: LeaderResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(leader.leader, None);

        // past the discovery window a lone node leads itself
        tokio::time::sleep(Duration::from_millis(500)).await;

        let (_, body) = get(router.clone(), paths::cluster::LEADER).await;
        let leader: LeaderResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(leader.leader, Some(local));
        assert!(leader.is_self);

        let (status, body) = get(router, paths::cluster::STATUS).await;
        assert_eq!(status, StatusCode::OK);
        let cluster: ClusterStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(cluster.node, local);
        assert_eq!(cluster.ring, vec![local.address]);
        assert!(cluster.heartbeat_seq >= 4);
    }

    #[tokio::test]
    async fn test_status_fails_once_node_is_gone() {
        let node = lone_node();
        let router = api(node.handle());
        node.shutdown().await.unwrap();

        let (status, _) = get(router, paths::cluster::STATUS).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
