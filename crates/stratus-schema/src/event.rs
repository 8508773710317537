use crate::cluster::Cluster;
use crate::types::{ClusterId, EventId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewCluster,
    ClusterDeleted,
    ClusterState,
    Log,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NewCluster => "new_cluster",
            EventKind::ClusterDeleted => "cluster_deleted",
            EventKind::ClusterState => "cluster_state",
            EventKind::Log => "log",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event as stored in the event log and delivered to subscribers.
///
/// `id` is assigned by the log on emission; events built with
/// [`Event::new`] carry `0` until then.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub cluster_id: ClusterId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<Cluster>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: String,
}

impl Event {
    pub fn new(kind: EventKind, cluster_id: ClusterId) -> Self {
        Self {
            id: 0,
            kind,
            cluster_id,
            cluster: None,
            description: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster: Cluster) -> Self {
        self.cluster = Some(cluster);
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
