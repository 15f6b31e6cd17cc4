// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend for the `whirl` renderer contract.
use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::debug;
use whirl_render::{
    Acquire, DrawOutcome, FenceWait, FrameBackend, FrameScheduler, PresentStatus, RenderSettings,
    RenderSize, Renderer, UniformUpdater,
};

pub mod context;
pub mod error;
pub mod geometry;
pub mod ledger;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

use context::GpuContext;
pub use error::RenderError;
use geometry::Geometry;
use ledger::ResourceLedger;
use shader::ShaderCode;
use swapchain::{present_mode_for, LifecycleInputs, Presentation};
use sync::{create_slots, timeout_ns, FrameSlot};

/// Where the build script leaves the compiled SPIR-V.
pub const DEFAULT_SHADER_DIR: &str = env!("OUT_DIR");

pub struct VkRenderer {
    scheduler: FrameScheduler,
    core: RenderCore,
}

/// Device objects plus the GPU half of the frame cycle.
struct RenderCore {
    presentation: Option<Presentation>,
    geometry: Option<Geometry>,
    slots: Vec<FrameSlot>,
    shaders: ShaderCode,
    uniforms: UniformUpdater,
    size: RenderSize,
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
    fence_timeout_ns: u64,
    ledger: ResourceLedger,
    ctx: GpuContext,
}

impl RenderCore {
    unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        settings: &RenderSettings,
    ) -> Result<Self> {
        let shaders = ShaderCode::load(&settings.shader_dir)?;
        let ctx = GpuContext::new(window, display)?;

        // From here on Drop cleans up whatever was created.
        let mut core = Self {
            presentation: None,
            geometry: None,
            slots: Vec::new(),
            shaders,
            uniforms: UniformUpdater::new(settings.rotation_period),
            size: settings.size,
            present_mode: present_mode_for(settings.present_mode),
            clear_color: settings.clear_color,
            fence_timeout_ns: timeout_ns(settings.fence_timeout),
            ledger: ResourceLedger::new(),
            ctx,
        };
        core.geometry = Some(Geometry::upload(&core.ctx, &mut core.ledger)?);
        core.slots = create_slots(&core.ctx.device, &mut core.ledger, settings.slot_count())?;
        core.create_presentation()?;
        Ok(core)
    }

    unsafe fn create_presentation(&mut self) -> Result<()> {
        let geometry = self.geometry.as_ref().context("geometry not uploaded")?;
        let inputs = LifecycleInputs {
            size: self.size,
            present_mode: self.present_mode,
            clear_color: self.clear_color,
            shaders: &self.shaders,
            geometry,
        };
        self.presentation = Some(Presentation::create(&self.ctx, &mut self.ledger, &inputs)?);
        Ok(())
    }

    fn presentation(&self) -> Result<&Presentation> {
        self.presentation.as_ref().context("presentation not created")
    }
}

impl FrameBackend for RenderCore {
    fn image_count(&self) -> usize {
        self.presentation.as_ref().map_or(0, |p| p.images.len())
    }

    fn extent_is_zero(&self) -> bool {
        if self.size.is_zero() {
            return true;
        }
        match unsafe { self.ctx.surface_capabilities() } {
            Ok(caps) => caps.current_extent.width == 0 || caps.current_extent.height == 0,
            Err(_) => true,
        }
    }

    fn wait_slot(&mut self, slot: usize) -> Result<FenceWait> {
        unsafe { self.slots[slot].wait(&self.ctx.device, self.fence_timeout_ns) }
    }

    fn acquire(&mut self, slot: usize) -> Result<Acquire> {
        let p = self.presentation()?;
        let acquired = unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                p.swapchain,
                u64::MAX,
                self.slots[slot].image_acquired,
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((index, suboptimal)) => Ok(Acquire::Image {
                index: index as usize,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::Stale),
            Err(result) => Err(RenderError::Vulkan {
                call: "vkAcquireNextImageKHR",
                result,
            }
            .into()),
        }
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        unsafe { self.slots[slot].reset(&self.ctx.device) }
    }

    fn write_uniforms(&mut self, image: usize) -> Result<()> {
        let p = self.presentation()?;
        let aspect = RenderSize {
            width: p.extent.width,
            height: p.extent.height,
        }
        .aspect();
        let payload = self.uniforms.sample(aspect);
        unsafe {
            p.images[image]
                .uniform
                .write_mapped(std::slice::from_ref(&payload))
        }
    }

    // STRICT PER-FRAME ORDER:
    // 1) submit waits on the slot's acquire semaphore at COLOR_ATTACHMENT_OUTPUT,
    //    signals THIS image's render-complete semaphore and arms the slot fence
    // 2) present waits on that same render-complete semaphore
    fn submit(&mut self, slot: usize, image: usize) -> Result<()> {
        let p = self.presentation()?;
        let s = &self.slots[slot];
        let img = &p.images[image];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &s.image_acquired,
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &img.command_buffer,
            signal_semaphore_count: 1,
            p_signal_semaphores: &img.render_complete,
            ..Default::default()
        };
        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.queue, std::slice::from_ref(&submit), s.in_flight)
                .context("queue_submit")
        }
    }

    fn present(&mut self, image: usize) -> Result<PresentStatus> {
        let p = self.presentation()?;
        let index = image as u32;
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &p.images[image].render_complete,
            swapchain_count: 1,
            p_swapchains: &p.swapchain,
            p_image_indices: &index,
            ..Default::default()
        };
        match unsafe { self.ctx.swapchain_loader.queue_present(self.ctx.queue, &present) } {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::Stale),
            Err(result) => Err(RenderError::Vulkan {
                call: "vkQueuePresentKHR",
                result,
            }
            .into()),
        }
    }

    fn recreate(&mut self) -> Result<()> {
        unsafe {
            if let Some(old) = self.presentation.take() {
                old.destroy(&self.ctx, &mut self.ledger);
            }
            self.create_presentation()
        }
    }
}

impl Drop for RenderCore {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.device_wait_idle().ok();
            if let Some(p) = self.presentation.take() {
                p.destroy(&self.ctx, &mut self.ledger);
            }
            if let Some(g) = self.geometry.take() {
                g.destroy(&self.ctx.device, &mut self.ledger);
            }
            for slot in self.slots.drain(..) {
                slot.destroy(&self.ctx.device, &mut self.ledger);
            }
        }
        if self.ledger.report_leaks() {
            debug!("all device objects released");
        }
    }
}

impl VkRenderer {
    pub fn frames_in_flight(&self) -> usize {
        self.scheduler.slot_count()
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        settings: &RenderSettings,
    ) -> Result<Self> {
        let core = unsafe { RenderCore::new(window, display, settings)? };
        let scheduler = FrameScheduler::new(core.slots.len(), core.image_count());
        debug!(images = core.image_count(), "frame scheduler armed");
        Ok(Self { scheduler, core })
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size != self.core.size {
            debug!(width = size.width, height = size.height, "surface resized");
            self.core.size = size;
            self.scheduler.mark_stale();
        }
        Ok(())
    }

    fn render(&mut self) -> Result<DrawOutcome> {
        self.scheduler.draw(&mut self.core)
    }
}
