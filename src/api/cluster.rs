use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::Result;
use crate::node::{ClusterHandle, ClusterStatus, NodeId};

/// Who this node currently follows
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderResponse {
    pub leader: Option<NodeId>,
    pub is_self: bool,
}

#[instrument(skip(handle))]
pub async fn status(State(handle): State<ClusterHandle>) -> Result<Json<ClusterStatus>> {
    Ok(Json(handle.status().await?))
}

#[instrument(skip(handle))]
pub async fn leader(State(handle): State<ClusterHandle>) -> Json<LeaderResponse> {
    Json(LeaderResponse {
        leader: handle.current_leader_id(),
        is_self: handle.is_self_leader(),
    })
}
