//! # Service Layer
//!
//! Transport-independent service surfaces. Each service is a thin
//! adapter from typed request structs onto the payload and stream
//! managers; any frontend (HTTP, RPC, CLI shims) composes these without
//! pulling in business logic of its own.

use std::sync::Arc;

use crate::manager::PayloadManager;
use crate::stream::StreamManager;

pub mod admin;
pub mod catalog;
pub mod data;
pub mod stream;

pub use admin::{AdminService, StatsResponse};
pub use catalog::{
    AllocateRequest, CatalogService, LineageRequest, LineageResponse, MetadataEventRequest,
    MetadataEventResponse, MetadataUpdateRequest, SpillOutcome, SpillRequest,
};
pub use data::{AcquireLeaseRequest, AcquireLeaseResponse, DataService};
pub use stream::{
    AppendRequest, CommitOffsetRequest, CreateStreamRequest, GetCommittedResponse,
    RangeRequest, ReadRequest, StreamService, SubscribeRequest,
};

/// Dependency container shared by all services.
#[derive(Clone)]
pub struct ServiceContext {
    pub manager: Arc<PayloadManager>,
    pub streams: Arc<StreamManager>,
}

impl ServiceContext {
    pub fn new(manager: Arc<PayloadManager>, streams: Arc<StreamManager>) -> Self {
        Self { manager, streams }
    }
}
