//! Object tier backend.
//!
//! Stateless wrapper over a remote HTTP object endpoint (S3-style path
//! addressing). A payload maps to a single object; a PUT is the unit of
//! atomicity, so the `fsync` flag has no meaning here and is ignored.
//! Offsets are likewise not meaningful; the location carries a full URI.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::core::{Error, Location, PayloadId, Result, Tier};

use super::{Buffer, StorageBackend};

/// Remote object-store tier backend.
pub struct ObjectBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl ObjectBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn object_uri(&self, id: &PayloadId) -> String {
        format!("{}/{}.bin", self.endpoint, id.canonical())
    }

    fn status_error(op: &str, id: &PayloadId, status: StatusCode) -> Error {
        if status == StatusCode::NOT_FOUND {
            Error::NotFound(format!("object payload {}", id))
        } else {
            Error::Io(format!("object {} {}: http {}", op, id, status))
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectBackend {
    async fn allocate(&self, _id: &PayloadId, _size_bytes: u64) -> Result<Location> {
        Err(Error::Unsupported(
            "object tier does not support direct allocation".to_string(),
        ))
    }

    async fn read(&self, id: &PayloadId) -> Result<Buffer> {
        let response = self
            .client
            .get(self.object_uri(id))
            .send()
            .await
            .map_err(|e| Error::Io(format!("object get {}: {}", id, e)))?;
        if !response.status().is_success() {
            return Err(Self::status_error("get", id, response.status()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Io(format!("object body {}: {}", id, e)))?;
        Ok(Buffer::Owned(bytes.to_vec()))
    }

    async fn size(&self, id: &PayloadId) -> Result<u64> {
        let response = self
            .client
            .head(self.object_uri(id))
            .send()
            .await
            .map_err(|e| Error::Io(format!("object head {}: {}", id, e)))?;
        if !response.status().is_success() {
            return Err(Self::status_error("head", id, response.status()));
        }
        response
            .content_length()
            .ok_or_else(|| Error::Io(format!("object head {}: missing content length", id)))
    }

    async fn write(&self, id: &PayloadId, data: &[u8], _fsync: bool) -> Result<()> {
        let response = self
            .client
            .put(self.object_uri(id))
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| Error::Io(format!("object put {}: {}", id, e)))?;
        if !response.status().is_success() {
            return Err(Self::status_error("put", id, response.status()));
        }
        Ok(())
    }

    async fn remove(&self, id: &PayloadId) -> Result<()> {
        let response = self
            .client
            .delete(self.object_uri(id))
            .send()
            .await
            .map_err(|e| Error::Io(format!("object delete {}: {}", id, e)))?;
        // absent objects are fine, remove is idempotent
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(Self::status_error("delete", id, response.status()));
        }
        Ok(())
    }

    fn location(&self, id: &PayloadId, length: u64) -> Location {
        Location::Object {
            uri: self.object_uri(id),
            length,
        }
    }

    fn tier_type(&self) -> Tier {
        Tier::Object
    }
}
