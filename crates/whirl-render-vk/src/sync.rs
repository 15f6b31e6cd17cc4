// SPDX-License-Identifier: CEPL-1.0
//! Frame-slot synchronisation objects.
use std::time::Duration;

use anyhow::{Context, Result};
use ash::vk;
use whirl_render::FenceWait;

use crate::error::RenderError;
use crate::ledger::{create_all, ResourceKind, ResourceLedger};

/// Acquire semaphore plus completion fence for one in-flight frame.
/// The fence starts signaled so the first wait on a fresh slot returns at once.
#[derive(Debug)]
pub struct FrameSlot {
    pub image_acquired: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    pub unsafe fn create(device: &ash::Device, ledger: &mut ResourceLedger) -> Result<Self> {
        let image_acquired = create_semaphore(device, ledger)?;
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let in_flight = match device.create_fence(&fence_ci, None) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_acquired, None);
                ledger.destroyed(ResourceKind::Semaphore);
                return Err(anyhow::Error::new(e).context("create_fence"));
            }
        };
        ledger.created(ResourceKind::Fence);
        Ok(Self {
            image_acquired,
            in_flight,
        })
    }

    pub unsafe fn wait(&self, device: &ash::Device, timeout_ns: u64) -> Result<FenceWait> {
        match device.wait_for_fences(&[self.in_flight], true, timeout_ns) {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(result) => Err(RenderError::Vulkan {
                call: "vkWaitForFences",
                result,
            }
            .into()),
        }
    }

    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        device
            .reset_fences(&[self.in_flight])
            .context("reset_fences")
    }

    pub unsafe fn destroy(self, device: &ash::Device, ledger: &mut ResourceLedger) {
        device.destroy_fence(self.in_flight, None);
        device.destroy_semaphore(self.image_acquired, None);
        ledger.destroyed(ResourceKind::Fence);
        ledger.destroyed(ResourceKind::Semaphore);
    }
}

pub unsafe fn create_slots(
    device: &ash::Device,
    ledger: &mut ResourceLedger,
    count: usize,
) -> Result<Vec<FrameSlot>> {
    create_all(
        ledger,
        count,
        |ledger| FrameSlot::create(device, ledger),
        |slot, ledger| slot.destroy(device, ledger),
    )
}

pub unsafe fn create_semaphore(device: &ash::Device, ledger: &mut ResourceLedger) -> Result<vk::Semaphore> {
    let sem = device
        .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        .context("create_semaphore")?;
    ledger.created(ResourceKind::Semaphore);
    Ok(sem)
}

/// Floor for bounded fence waits. A zero timeout would turn every wait into
/// a poll.
pub const MIN_FENCE_TIMEOUT: Duration = Duration::from_millis(1);

/// Fence timeout in nanoseconds, at least [`MIN_FENCE_TIMEOUT`] and
/// saturating at "wait forever".
pub fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.max(MIN_FENCE_TIMEOUT).as_nanos()).unwrap_or(u64::MAX)
}
