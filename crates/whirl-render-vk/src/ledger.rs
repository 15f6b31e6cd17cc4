// SPDX-License-Identifier: CEPL-1.0
//! Live-object bookkeeping for everything the backend creates on the device.
use std::collections::BTreeMap;

use anyhow::Result;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceKind {
    Swapchain,
    ImageView,
    RenderPass,
    Framebuffer,
    DescriptorSetLayout,
    DescriptorPool,
    PipelineLayout,
    Pipeline,
    ShaderModule,
    CommandBuffer,
    Buffer,
    Memory,
    Semaphore,
    Fence,
}

#[derive(Debug, Default)]
pub struct ResourceLedger {
    live: BTreeMap<ResourceKind, usize>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&mut self, kind: ResourceKind) {
        self.created_n(kind, 1);
    }

    pub fn created_n(&mut self, kind: ResourceKind, n: usize) {
        *self.live.entry(kind).or_default() += n;
    }

    pub fn destroyed(&mut self, kind: ResourceKind) {
        self.destroyed_n(kind, 1);
    }

    pub fn destroyed_n(&mut self, kind: ResourceKind, n: usize) {
        let count = self.live.entry(kind).or_default();
        if *count < n {
            warn!(?kind, live = *count, released = n, "released more objects than were created");
        }
        *count = count.saturating_sub(n);
    }

    pub fn live(&self, kind: ResourceKind) -> usize {
        self.live.get(&kind).copied().unwrap_or(0)
    }

    /// Total live objects across all kinds.
    pub fn outstanding(&self) -> usize {
        self.live.values().sum()
    }

    /// Logs one warning per leaked kind. Returns true when nothing leaked.
    pub fn report_leaks(&self) -> bool {
        let mut clean = true;
        for (kind, &n) in self.live.iter().filter(|&(_, &n)| n > 0) {
            warn!(?kind, count = n, "vulkan objects still alive at shutdown");
            clean = false;
        }
        clean
    }
}

/// Builds `count` objects in order. If one fails, those already built are
/// released, newest first, before the error is returned.
pub fn create_all<T>(
    ledger: &mut ResourceLedger,
    count: usize,
    mut create: impl FnMut(&mut ResourceLedger) -> Result<T>,
    mut release: impl FnMut(T, &mut ResourceLedger),
) -> Result<Vec<T>> {
    let mut built = Vec::with_capacity(count);
    for _ in 0..count {
        match create(ledger) {
            Ok(item) => built.push(item),
            Err(e) => {
                while let Some(item) = built.pop() {
                    release(item, ledger);
                }
                return Err(e);
            }
        }
    }
    Ok(built)
}
