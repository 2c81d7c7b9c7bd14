//! Hardware-backed device context and memory registration.

use std::io;
use std::sync::Arc;

use sideway::ibverbs::device::{DeviceInfo, DeviceList};
use sideway::ibverbs::device_context::DeviceContext;
use sideway::ibverbs::memory_region::MemoryRegion;
use sideway::ibverbs::protection_domain::ProtectionDomain;
use sideway::ibverbs::AccessFlags;

use crate::memory::{MemoryRegistrar, RegionHandle};

pub struct RdmaContext {
    pub(crate) ctx: Arc<DeviceContext>,
    pub(crate) pd: Arc<ProtectionDomain>,
}

impl RdmaContext {
    pub fn open(dev_name: &str) -> io::Result<Arc<Self>> {
        let device_list = DeviceList::new().map_err(|e| io::Error::other(e.to_string()))?;

        let device = device_list
            .iter()
            .find(|d| d.name() == dev_name)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("device {} not found", dev_name),
                )
            })?;

        let ctx = device.open().map_err(|e| io::Error::other(e.to_string()))?;
        let pd = ctx.alloc_pd().map_err(|e| io::Error::other(e.to_string()))?;

        Ok(Arc::new(Self { ctx, pd }))
    }
}

struct MrGuard(#[allow(dead_code)] Arc<MemoryRegion>);

// SAFETY: the region is only held to keep the registration pinned; it is
// never accessed through this guard.
unsafe impl Send for MrGuard {}
unsafe impl Sync for MrGuard {}

impl MemoryRegistrar for RdmaContext {
    fn register(&self, addr: usize, len: usize) -> io::Result<RegionHandle> {
        let access = AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead;
        // The caller owns the memory at `addr` for the guard's lifetime.
        let mr = unsafe {
            self.pd
                .reg_mr(addr, len, access)
                .map_err(|e| io::Error::other(e.to_string()))?
        };
        Ok(RegionHandle {
            lkey: mr.lkey(),
            guard: Box::new(MrGuard(mr)),
        })
    }
}
