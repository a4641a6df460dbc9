// src/artifacts.rs - Bounded in-memory side-channel store for repair artifacts

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::schema::SchemaError;

pub const DEFAULT_ARTIFACT_CAPACITY: usize = 100;

/// Final disposition of one request's extraction and repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    Repaired,
    Passthrough,
    Failed,
    SchemaInvalid,
}

/// Side-channel record produced after a stream finalizes, retrievable by
/// request id until evicted.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub request_id: String,
    pub timestamp: String,
    pub model: String,
    pub original_content: String,
    pub repaired_content: String,
    pub repairs_applied: Vec<String>,
    pub parse_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_errors: Option<Vec<SchemaError>>,
    pub status: ArtifactStatus,
}

/// Aggregates for the /metrics endpoint, computed over retained artifacts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub repaired: usize,
    pub parse_success: usize,
    pub repair_types: HashMap<String, u64>,
}

#[derive(Default)]
struct StoreInner {
    by_id: HashMap<String, Artifact>,
    order: VecDeque<String>,
}

/// Bounded mapping from request id to artifact. Insertion past capacity
/// evicts the oldest entry by insertion order; request ids are unique per
/// process so re-insertion only replaces the payload.
pub struct ArtifactStore {
    capacity: usize,
    inner: RwLock<StoreInner>,
}

impl ArtifactStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(StoreInner::default()),
        }
    }

    pub async fn insert(&self, artifact: Artifact) {
        let mut inner = self.inner.write().await;

        if inner.by_id.contains_key(&artifact.request_id) {
            inner.by_id.insert(artifact.request_id.clone(), artifact);
            return;
        }

        while inner.by_id.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.by_id.remove(&oldest);
                }
                None => break,
            }
        }

        inner.order.push_back(artifact.request_id.clone());
        inner.by_id.insert(artifact.request_id.clone(), artifact);
    }

    pub async fn lookup(&self, request_id: &str) -> Option<Artifact> {
        self.inner.read().await.by_id.get(request_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.read().await;
        let mut stats = StoreStats {
            total: inner.by_id.len(),
            ..Default::default()
        };

        for artifact in inner.by_id.values() {
            if artifact.status == ArtifactStatus::Repaired {
                stats.repaired += 1;
            }
            if artifact.parse_success {
                stats.parse_success += 1;
            }
            for repair in &artifact.repairs_applied {
                *stats.repair_types.entry(repair.clone()).or_insert(0) += 1;
            }
        }

        stats
    }
}
