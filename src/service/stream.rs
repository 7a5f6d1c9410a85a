//! Stream service: append-only log surface.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::Result;
use crate::repository::{StreamEntryRecord, StreamRecord};
use crate::stream::{AppendItem, AppendResult};

use super::ServiceContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStreamRequest {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub retention_max_entries: Option<u64>,
    #[serde(default)]
    pub retention_max_age_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub namespace: String,
    pub name: String,
    pub items: Vec<AppendItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub start_offset: u64,
    #[serde(default)]
    pub max_entries: Option<u64>,
    #[serde(default)]
    pub min_append_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeRequest {
    pub namespace: String,
    pub name: String,
    pub start_offset: u64,
    pub end_offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitOffsetRequest {
    pub namespace: String,
    pub name: String,
    pub consumer_group: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCommittedResponse {
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub start_offset: u64,
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
}

fn default_max_inflight() -> usize {
    64
}

/// Append-only log surface over the stream manager.
#[derive(Clone)]
pub struct StreamService {
    ctx: ServiceContext,
}

impl StreamService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub async fn create(&self, request: CreateStreamRequest) -> Result<StreamRecord> {
        self.ctx
            .streams
            .create_stream(
                &request.namespace,
                &request.name,
                request.retention_max_entries,
                request.retention_max_age_sec,
            )
            .await
    }

    pub async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.ctx.streams.delete_stream(namespace, name).await
    }

    pub async fn append(&self, request: AppendRequest) -> Result<AppendResult> {
        self.ctx
            .streams
            .append(&request.namespace, &request.name, request.items)
            .await
    }

    pub async fn read(&self, request: ReadRequest) -> Result<Vec<StreamEntryRecord>> {
        self.ctx
            .streams
            .read(
                &request.namespace,
                &request.name,
                request.start_offset,
                request.max_entries,
                request.min_append_time_ms,
            )
            .await
    }

    pub async fn get_range(&self, request: RangeRequest) -> Result<Vec<StreamEntryRecord>> {
        self.ctx
            .streams
            .get_range(
                &request.namespace,
                &request.name,
                request.start_offset,
                request.end_offset,
            )
            .await
    }

    pub async fn commit(&self, request: CommitOffsetRequest) -> Result<()> {
        self.ctx
            .streams
            .commit_offset(
                &request.namespace,
                &request.name,
                &request.consumer_group,
                request.offset,
            )
            .await
    }

    pub async fn get_committed(
        &self,
        namespace: &str,
        name: &str,
        consumer_group: &str,
    ) -> Result<GetCommittedResponse> {
        let offset = self
            .ctx
            .streams
            .get_committed(namespace, name, consumer_group)
            .await?;
        Ok(GetCommittedResponse { offset })
    }

    pub async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<mpsc::Receiver<StreamEntryRecord>> {
        self.ctx
            .streams
            .subscribe(
                &request.namespace,
                &request.name,
                request.start_offset,
                request.max_inflight,
            )
            .await
    }
}
