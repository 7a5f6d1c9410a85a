//! GPU tier backend.
//!
//! Device memory is managed through a process-wide device context built
//! once at startup; backends never construct their own adapters. Payload
//! bytes live in device buffers; host reads go through a staging buffer
//! readback. Each allocation exports an opaque handle token that external
//! readers exchange with the service to reach the device buffer, since
//! device pointers themselves cannot cross the process boundary here.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Error, Location, PayloadId, Result, Tier};

use super::{Buffer, StorageBackend};

/// Copy granularity the device requires.
const COPY_ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

static DEVICE_CONTEXT: OnceCell<Arc<GpuContext>> = OnceCell::new();

/// Process-singleton device context.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    device_id: u32,
}

impl GpuContext {
    /// Initialize the singleton for the first configured device ordinal.
    /// Subsequent calls return the existing context.
    pub fn init(device_ids: &[u32]) -> Result<Arc<GpuContext>> {
        if let Some(ctx) = DEVICE_CONTEXT.get() {
            return Ok(ctx.clone());
        }
        let device_id = device_ids.first().copied().unwrap_or(0);

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = futures::executor::block_on(instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            },
        ))
        .ok_or_else(|| Error::Unsupported("no gpu adapter available".to_string()))?;

        let (device, queue) = futures::executor::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("stratum-gpu-tier"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
            },
            None,
        ))
        .map_err(|e| Error::Unsupported(format!("gpu device: {}", e)))?;

        let ctx = Arc::new(GpuContext {
            device,
            queue,
            device_id,
        });
        let _ = DEVICE_CONTEXT.set(ctx.clone());
        tracing::info!(device_id, "gpu device context initialized");
        Ok(ctx)
    }

    /// The initialized singleton; `InvalidState` before `init`.
    pub fn get() -> Result<Arc<GpuContext>> {
        DEVICE_CONTEXT
            .get()
            .cloned()
            .ok_or_else(|| Error::InvalidState("gpu context not initialized".to_string()))
    }

    /// Flush outstanding device work. Called on server shutdown.
    pub fn shutdown(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

struct GpuAllocation {
    buffer: wgpu::Buffer,
    /// Logical payload length; the device buffer itself is padded to
    /// copy alignment.
    size: u64,
    ipc_token: String,
}

/// Device-memory tier backend.
pub struct GpuBackend {
    context: Arc<GpuContext>,
    allocations: RwLock<HashMap<PayloadId, Arc<GpuAllocation>>>,
    capacity_bytes: u64,
}

impl GpuBackend {
    pub fn new(context: Arc<GpuContext>, capacity_bytes: u64) -> Self {
        Self {
            context,
            allocations: RwLock::new(HashMap::new()),
            capacity_bytes,
        }
    }

    fn padded(size: u64) -> u64 {
        size.div_ceil(COPY_ALIGN) * COPY_ALIGN
    }

    fn ipc_token(device_id: u32) -> String {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        format!("{:08x}{}", device_id, hex::encode(nonce))
    }

    fn used_bytes(&self) -> u64 {
        self.allocations.read().values().map(|a| a.size).sum()
    }

    fn allocation(&self, id: &PayloadId) -> Result<Arc<GpuAllocation>> {
        self.allocations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("gpu payload {}", id)))
    }

    fn create_allocation(&self, id: &PayloadId, size: u64) -> Result<Arc<GpuAllocation>> {
        if self.used_bytes() + size > self.capacity_bytes {
            return Err(Error::ResourceExhausted(format!(
                "gpu tier full: {} + {} exceeds {}",
                self.used_bytes(),
                size,
                self.capacity_bytes
            )));
        }
        let buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("stratum-payload"),
            // zero-length payloads still get one aligned slot
            size: Self::padded(size).max(COPY_ALIGN),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let allocation = Arc::new(GpuAllocation {
            buffer,
            size,
            ipc_token: Self::ipc_token(self.context.device_id),
        });
        self.allocations.write().insert(*id, allocation.clone());
        Ok(allocation)
    }

    /// Copy device contents back to the host.
    fn readback(&self, allocation: &GpuAllocation) -> Result<Vec<u8>> {
        let padded = Self::padded(allocation.size);
        if padded == 0 {
            return Ok(Vec::new());
        }
        let staging = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("stratum-readback"),
            size: padded,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("stratum-readback"),
            });
        encoder.copy_buffer_to_buffer(&allocation.buffer, 0, &staging, 0, padded);
        self.context.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.context.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| Error::Io("gpu readback channel closed".to_string()))?
            .map_err(|e| Error::Io(format!("gpu map: {:?}", e)))?;

        let data = slice.get_mapped_range()[..allocation.size as usize].to_vec();
        staging.unmap();
        Ok(data)
    }
}

#[async_trait]
impl StorageBackend for GpuBackend {
    async fn allocate(&self, id: &PayloadId, size_bytes: u64) -> Result<Location> {
        let allocation = self.create_allocation(id, size_bytes)?;
        Ok(Location::Gpu {
            device_id: self.context.device_id,
            ipc_handle: allocation.ipc_token.clone(),
            length: size_bytes,
        })
    }

    async fn read(&self, id: &PayloadId) -> Result<Buffer> {
        let allocation = self.allocation(id)?;
        Ok(Buffer::Owned(self.readback(&allocation)?))
    }

    async fn size(&self, id: &PayloadId) -> Result<u64> {
        Ok(self.allocation(id)?.size)
    }

    async fn write(&self, id: &PayloadId, data: &[u8], _fsync: bool) -> Result<()> {
        self.allocations.write().remove(id);
        let allocation = self.create_allocation(id, data.len() as u64)?;
        if !data.is_empty() {
            // pad the tail so the copy size satisfies device alignment
            let padded = Self::padded(data.len() as u64) as usize;
            if padded == data.len() {
                self.context.queue.write_buffer(&allocation.buffer, 0, data);
            } else {
                let mut staged = data.to_vec();
                staged.resize(padded, 0);
                self.context.queue.write_buffer(&allocation.buffer, 0, &staged);
            }
            self.context.queue.submit(std::iter::empty());
        }
        Ok(())
    }

    async fn remove(&self, id: &PayloadId) -> Result<()> {
        if let Some(allocation) = self.allocations.write().remove(id) {
            allocation.buffer.destroy();
        }
        Ok(())
    }

    fn location(&self, id: &PayloadId, length: u64) -> Location {
        let handle = self
            .allocations
            .read()
            .get(id)
            .map(|a| a.ipc_token.clone())
            .unwrap_or_default();
        Location::Gpu {
            device_id: self.context.device_id,
            ipc_handle: handle,
            length,
        }
    }

    fn tier_type(&self) -> Tier {
        Tier::Gpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend() -> Option<GpuBackend> {
        match GpuContext::init(&[0]) {
            Ok(ctx) => Some(GpuBackend::new(ctx, 1024 * 1024)),
            // no adapter in this environment; nothing to exercise
            Err(_) => None,
        }
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let Some(backend) = test_backend() else { return };
        let id = PayloadId::generate();

        let data: Vec<u8> = (0..100).map(|i| (i * 3 & 0xFF) as u8).collect();
        backend.write(&id, &data, false).await.unwrap();
        assert_eq!(backend.read(&id).await.unwrap().as_slice(), data.as_slice());
        assert_eq!(backend.size(&id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_read_after_remove_is_not_found() {
        let Some(backend) = test_backend() else { return };
        let id = PayloadId::generate();

        backend.write(&id, b"vram", false).await.unwrap();
        backend.remove(&id).await.unwrap();
        assert!(matches!(backend.read(&id).await, Err(Error::NotFound(_))));
        backend.remove(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_allocate_exports_handle_token() {
        let Some(backend) = test_backend() else { return };
        let id = PayloadId::generate();

        let location = backend.allocate(&id, 16).await.unwrap();
        match location {
            Location::Gpu { ipc_handle, length, .. } => {
                assert_eq!(length, 16);
                assert!(!ipc_handle.is_empty());
            }
            other => panic!("unexpected location {:?}", other),
        }
    }
}
