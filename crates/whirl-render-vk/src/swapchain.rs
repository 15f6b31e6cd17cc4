// SPDX-License-Identifier: CEPL-1.0
//! Presentation lifecycle: everything whose shape depends on the surface.
//!
//! A [`Presentation`] owns the swapchain and, per presentable image, its view,
//! framebuffer, command buffer, uniform buffer, descriptor set and
//! render-complete semaphore. It is created and destroyed as one unit; a stale
//! surface is handled by destroying the whole block and creating a new one.
use anyhow::{Context, Result};
use ash::vk;
use tracing::{debug, info};
use whirl_render::{PresentMode, RenderSize, UniformPayload};

use crate::context::GpuContext;
use crate::error::RenderError;
use crate::geometry::Geometry;
use crate::ledger::{ResourceKind, ResourceLedger};
use crate::memory::{create_buffer, GpuBuffer};
use crate::pipeline::{create_descriptor_set_layout, create_pipeline, create_render_pass};
use crate::shader::ShaderCode;
use crate::sync::create_semaphore;

pub fn present_mode_for(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
    }
}

/// B8G8R8A8_SRGB, then R8G8B8A8_SRGB (both sRGB non-linear), then whatever
/// the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR, RenderError> {
    let preferred = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    match formats {
        [] => Err(RenderError::NoSurfaceFormat),
        // Surface has no preference.
        [only] if only.format == vk::Format::UNDEFINED => Ok(preferred),
        _ => {
            let pick = |fmt: vk::Format| {
                formats
                    .iter()
                    .copied()
                    .find(|f| f.format == fmt && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            };
            Ok(pick(vk::Format::B8G8R8A8_SRGB)
                .or_else(|| pick(vk::Format::R8G8B8A8_SRGB))
                .unwrap_or(formats[0]))
        }
    }
}

/// The required mode or nothing.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    required: vk::PresentModeKHR,
) -> Result<vk::PresentModeKHR, RenderError> {
    if modes.contains(&required) {
        Ok(required)
    } else {
        Err(RenderError::PresentModeUnavailable(required))
    }
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means no maximum).
pub fn image_count_from_caps(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

pub struct PresentableImage {
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
    pub command_buffer: vk::CommandBuffer,
    pub uniform: GpuBuffer,
    pub descriptor_set: vk::DescriptorSet,
    pub render_complete: vk::Semaphore,
}

pub struct LifecycleInputs<'a> {
    pub size: RenderSize,
    pub present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
    pub shaders: &'a ShaderCode,
    pub geometry: &'a Geometry,
}

pub struct Presentation {
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub render_pass: vk::RenderPass,
    pub set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub descriptor_pool: vk::DescriptorPool,
    pub images: Vec<PresentableImage>,
}

impl Presentation {
    pub unsafe fn create(
        ctx: &GpuContext,
        ledger: &mut ResourceLedger,
        inputs: &LifecycleInputs<'_>,
    ) -> Result<Self> {
        let mut p = Self {
            swapchain: vk::SwapchainKHR::null(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            present_mode: inputs.present_mode,
            render_pass: vk::RenderPass::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            images: Vec::new(),
        };
        match p.build(ctx, ledger, inputs) {
            Ok(()) => {
                info!(
                    format = ?p.format.format,
                    present_mode = ?p.present_mode,
                    width = p.extent.width,
                    height = p.extent.height,
                    images = p.images.len(),
                    "presentation ready"
                );
                Ok(p)
            }
            Err(e) => {
                p.destroy(ctx, ledger);
                Err(e)
            }
        }
    }

    unsafe fn build(
        &mut self,
        ctx: &GpuContext,
        ledger: &mut ResourceLedger,
        inputs: &LifecycleInputs<'_>,
    ) -> Result<()> {
        let device = &ctx.device;
        let caps = ctx.surface_capabilities()?;
        let formats = ctx
            .surface_loader
            .get_physical_device_surface_formats(ctx.phys, ctx.surface)
            .context("get_physical_device_surface_formats")?;
        let modes = ctx
            .surface_loader
            .get_physical_device_surface_present_modes(ctx.phys, ctx.surface)
            .context("get_physical_device_surface_present_modes")?;

        self.format = choose_surface_format(&formats)?;
        self.present_mode = choose_present_mode(&modes, inputs.present_mode)?;
        self.extent = extent_from_caps(&caps, inputs.size);
        let min_count = image_count_from_caps(&caps);

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: ctx.surface,
            min_image_count: min_count,
            image_format: self.format.format,
            image_color_space: self.format.color_space,
            image_extent: self.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: self.present_mode,
            clipped: vk::TRUE,
            ..Default::default()
        };
        self.swapchain = ctx
            .swapchain_loader
            .create_swapchain(&swap_info, None)
            .context("create_swapchain")?;
        ledger.created(ResourceKind::Swapchain);
        let images = ctx
            .swapchain_loader
            .get_swapchain_images(self.swapchain)
            .context("get_swapchain_images")?;

        self.render_pass = create_render_pass(device, ledger, self.format.format)?;
        self.set_layout = create_descriptor_set_layout(device, ledger)?;
        let (pipeline_layout, pipeline) =
            create_pipeline(device, ledger, self.render_pass, self.set_layout, inputs.shaders)?;
        self.pipeline_layout = pipeline_layout;
        self.pipeline = pipeline;

        let count = images.len() as u32;
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: count,
        }];
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: count,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        self.descriptor_pool = device
            .create_descriptor_pool(&pool_ci, None)
            .context("create_descriptor_pool")?;
        ledger.created(ResourceKind::DescriptorPool);

        let layouts = vec![self.set_layout; images.len()];
        let set_alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: count,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let sets = device
            .allocate_descriptor_sets(&set_alloc)
            .context("allocate_descriptor_sets")?;

        let ubo_size = std::mem::size_of::<UniformPayload>() as vk::DeviceSize;
        for (&image, descriptor_set) in images.iter().zip(sets) {
            // Each handle lands in the entry as soon as it exists so that a
            // failure part way through is still released by `destroy`.
            let uniform = create_buffer(
                ctx,
                ledger,
                ubo_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            let n = self.images.len();
            self.images.push(PresentableImage {
                view: vk::ImageView::null(),
                framebuffer: vk::Framebuffer::null(),
                command_buffer: vk::CommandBuffer::null(),
                uniform,
                descriptor_set,
                render_complete: vk::Semaphore::null(),
            });
            // Stays mapped until `destroy`; written once per frame.
            self.images[n].uniform.map(device)?;

            let view = create_view(device, ledger, image, self.format.format)?;
            self.images[n].view = view;
            self.images[n].framebuffer =
                create_framebuffer(device, ledger, self.render_pass, view, self.extent)?;
            self.images[n].render_complete = create_semaphore(device, ledger)?;
            self.images[n].command_buffer = allocate_command_buffer(ctx, ledger)?;

            let info = vk::DescriptorBufferInfo {
                buffer: self.images[n].uniform.buffer,
                offset: 0,
                range: ubo_size,
            };
            let write = vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: descriptor_set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: &info,
                ..Default::default()
            };
            device.update_descriptor_sets(std::slice::from_ref(&write), &[]);
        }

        for image in &self.images {
            self.record(device, image, inputs.geometry, inputs.clear_color)?;
        }
        Ok(())
    }

    /// Geometry is static, so each image's commands are recorded once here.
    unsafe fn record(
        &self,
        device: &ash::Device,
        image: &PresentableImage,
        geometry: &Geometry,
        clear_color: [f32; 4],
    ) -> Result<()> {
        let cmd = image.command_buffer;
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        device.begin_command_buffer(cmd, &begin)?;

        let clears = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        };
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: self.render_pass,
            framebuffer: image.framebuffer,
            render_area: area,
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);

        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
        let vp = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.extent.width as f32,
            height: self.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&vp));
        device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&area));
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.pipeline_layout,
            0,
            std::slice::from_ref(&image.descriptor_set),
            &[],
        );
        device.cmd_bind_vertex_buffers(cmd, 0, std::slice::from_ref(&geometry.vertices.buffer), &[0]);
        device.cmd_bind_index_buffer(cmd, geometry.indices.buffer, 0, vk::IndexType::UINT16);
        device.cmd_draw_indexed(cmd, geometry.index_count, 1, 0, 0, 0);

        device.cmd_end_render_pass(cmd);
        device.end_command_buffer(cmd)?;
        Ok(())
    }

    // STRICT TEARDOWN ORDER:
    // - device idle first; nothing below may still be referenced by the GPU
    // - command buffers before the framebuffers/pipeline/sets they record
    // - framebuffers before the render pass and views they use
    // - descriptor pool (frees the sets) before the set layout
    // - swapchain last; views were created from its images
    pub unsafe fn destroy(self, ctx: &GpuContext, ledger: &mut ResourceLedger) {
        let d = &ctx.device;
        d.device_wait_idle().ok();

        let cmds: Vec<_> = self
            .images
            .iter()
            .map(|i| i.command_buffer)
            .filter(|&c| c != vk::CommandBuffer::null())
            .collect();
        if !cmds.is_empty() {
            d.free_command_buffers(ctx.cmd_pool, &cmds);
            ledger.destroyed_n(ResourceKind::CommandBuffer, cmds.len());
        }
        for image in &self.images {
            if image.framebuffer != vk::Framebuffer::null() {
                d.destroy_framebuffer(image.framebuffer, None);
                ledger.destroyed(ResourceKind::Framebuffer);
            }
        }
        if self.pipeline != vk::Pipeline::null() {
            d.destroy_pipeline(self.pipeline, None);
            ledger.destroyed(ResourceKind::Pipeline);
        }
        if self.pipeline_layout != vk::PipelineLayout::null() {
            d.destroy_pipeline_layout(self.pipeline_layout, None);
            ledger.destroyed(ResourceKind::PipelineLayout);
        }
        if self.render_pass != vk::RenderPass::null() {
            d.destroy_render_pass(self.render_pass, None);
            ledger.destroyed(ResourceKind::RenderPass);
        }
        for image in self.images {
            if image.view != vk::ImageView::null() {
                d.destroy_image_view(image.view, None);
                ledger.destroyed(ResourceKind::ImageView);
            }
            if image.render_complete != vk::Semaphore::null() {
                d.destroy_semaphore(image.render_complete, None);
                ledger.destroyed(ResourceKind::Semaphore);
            }
            image.uniform.destroy(d, ledger);
        }
        if self.descriptor_pool != vk::DescriptorPool::null() {
            d.destroy_descriptor_pool(self.descriptor_pool, None);
            ledger.destroyed(ResourceKind::DescriptorPool);
        }
        if self.set_layout != vk::DescriptorSetLayout::null() {
            d.destroy_descriptor_set_layout(self.set_layout, None);
            ledger.destroyed(ResourceKind::DescriptorSetLayout);
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            ctx.swapchain_loader.destroy_swapchain(self.swapchain, None);
            ledger.destroyed(ResourceKind::Swapchain);
        }
        debug!(outstanding = ledger.outstanding(), "presentation destroyed");
    }
}

unsafe fn create_view(
    device: &ash::Device,
    ledger: &mut ResourceLedger,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let sub = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };
    let iv_info = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: sub,
        ..Default::default()
    };
    let view = device
        .create_image_view(&iv_info, None)
        .context("create_image_view")?;
    ledger.created(ResourceKind::ImageView);
    Ok(view)
}

unsafe fn create_framebuffer(
    device: &ash::Device,
    ledger: &mut ResourceLedger,
    render_pass: vk::RenderPass,
    view: vk::ImageView,
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let fb_info = vk::FramebufferCreateInfo {
        s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
        render_pass,
        attachment_count: 1,
        p_attachments: &view,
        width: extent.width,
        height: extent.height,
        layers: 1,
        ..Default::default()
    };
    let fb = device
        .create_framebuffer(&fb_info, None)
        .context("create_framebuffer")?;
    ledger.created(ResourceKind::Framebuffer);
    Ok(fb)
}

unsafe fn allocate_command_buffer(
    ctx: &GpuContext,
    ledger: &mut ResourceLedger,
) -> Result<vk::CommandBuffer> {
    let alloc = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: ctx.cmd_pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmd = ctx
        .device
        .allocate_command_buffers(&alloc)
        .context("allocate_command_buffers")?
        .into_iter()
        .next()
        .context("driver returned no command buffer")?;
    ledger.created(ResourceKind::CommandBuffer);
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    fn caps(min: u32, max: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D { width: 16, height: 16 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            ..Default::default()
        }
    }

    #[test]
    fn prefers_bgra_srgb() {
        let formats = [
            sf(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            sf(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_rgba_then_first() {
        let formats = [
            sf(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            sf(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::R8G8B8A8_SRGB);

        let formats = [sf(vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(choose_surface_format(&formats).unwrap().format, formats[0].format);
    }

    #[test]
    fn undefined_format_means_free_choice() {
        let formats = [sf(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn no_formats_is_fatal() {
        assert!(matches!(choose_surface_format(&[]), Err(RenderError::NoSurfaceFormat)));
    }

    #[test]
    fn required_present_mode_has_no_fallback() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::FIFO).unwrap(),
            vk::PresentModeKHR::FIFO
        );
        assert!(matches!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            Err(RenderError::PresentModeUnavailable(m)) if m == vk::PresentModeKHR::MAILBOX
        ));
    }

    #[test]
    fn present_mode_mapping() {
        assert_eq!(present_mode_for(PresentMode::Mailbox), vk::PresentModeKHR::MAILBOX);
        assert_eq!(present_mode_for(PresentMode::Fifo), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn current_extent_wins() {
        let c = caps(2, 0, (1024, 768));
        let e = extent_from_caps(&c, RenderSize { width: 800, height: 600 });
        assert_eq!((e.width, e.height), (1024, 768));
    }

    #[test]
    fn free_extent_is_clamped() {
        let c = caps(2, 0, (u32::MAX, u32::MAX));
        let e = extent_from_caps(&c, RenderSize { width: 800, height: 600 });
        assert_eq!((e.width, e.height), (800, 600));
        let e = extent_from_caps(&c, RenderSize { width: 8, height: 9000 });
        assert_eq!((e.width, e.height), (16, 2048));
    }

    #[test]
    fn image_count_is_min_plus_one_capped() {
        assert_eq!(image_count_from_caps(&caps(2, 0, (1, 1))), 3);
        assert_eq!(image_count_from_caps(&caps(2, 8, (1, 1))), 3);
        assert_eq!(image_count_from_caps(&caps(3, 3, (1, 1))), 3);
    }

    /// Runs only where a Vulkan driver offers `VK_EXT_headless_surface`
    /// (lavapipe, most desktop drivers); skipped otherwise.
    #[test]
    fn create_then_destroy_leaves_nothing_alive() {
        use crate::sync::create_slots;
        use std::path::Path;

        let ctx = match unsafe { GpuContext::headless() } {
            Ok(ctx) => ctx,
            Err(e) => {
                eprintln!("skipping: no headless vulkan device ({e:#})");
                return;
            }
        };
        let shaders = ShaderCode::load(Path::new(crate::DEFAULT_SHADER_DIR)).unwrap();
        let mut ledger = ResourceLedger::new();

        unsafe {
            let geometry = Geometry::upload(&ctx, &mut ledger).unwrap();
            let slots = create_slots(&ctx.device, &mut ledger, 3).unwrap();
            let baseline = ledger.outstanding();
            let inputs = LifecycleInputs {
                size: RenderSize {
                    width: 320,
                    height: 240,
                },
                present_mode: vk::PresentModeKHR::FIFO,
                clear_color: [0.0, 0.0, 0.0, 1.0],
                shaders: &shaders,
                geometry: &geometry,
            };

            // Twice, as a recreation would.
            for _ in 0..2 {
                let p = Presentation::create(&ctx, &mut ledger, &inputs).unwrap();
                let images = p.images.len();
                assert!(images > 0);
                assert!(p.images.iter().all(|i| i.uniform.is_mapped()));
                assert_eq!(ledger.live(ResourceKind::Framebuffer), images);
                assert_eq!(ledger.live(ResourceKind::CommandBuffer), images);
                p.destroy(&ctx, &mut ledger);
                assert_eq!(ledger.outstanding(), baseline);
            }

            for slot in slots {
                slot.destroy(&ctx.device, &mut ledger);
            }
            geometry.destroy(&ctx.device, &mut ledger);
            ctx.device.device_wait_idle().unwrap();
        }
        assert_eq!(ledger.outstanding(), 0);
        assert!(ledger.report_leaks());
    }
}
