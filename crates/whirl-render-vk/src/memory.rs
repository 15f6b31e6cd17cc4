// SPDX-License-Identifier: CEPL-1.0
//! Buffers, memory-type selection and staged uploads.
use std::ptr::NonNull;

use anyhow::{ensure, Context, Result};
use ash::vk;
use bytemuck::Pod;
use tracing::debug;

use crate::context::GpuContext;
use crate::error::RenderError;
use crate::ledger::{ResourceKind, ResourceLedger};

/// First memory type allowed by `type_bits` whose flags contain `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    let count = props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize].property_flags.contains(required)
        })
        .ok_or(RenderError::NoCompatibleMemoryType { type_bits, required })
}

/// A buffer with its own dedicated allocation.
#[derive(Debug)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    /// Host pointer while the memory is persistently mapped.
    mapped: Option<NonNull<u8>>,
}

impl GpuBuffer {
    /// Map the whole allocation until `destroy`. Host-visible memory only.
    pub unsafe fn map(&mut self, device: &ash::Device) -> Result<()> {
        if self.mapped.is_some() {
            return Ok(());
        }
        let ptr = device
            .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            .context("map_memory")?;
        self.mapped = Some(NonNull::new(ptr.cast::<u8>()).context("map_memory returned null")?);
        Ok(())
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Copy `data` to the start of a persistently mapped buffer.
    pub unsafe fn write_mapped<T: Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let ptr = self.mapped.context("buffer is not mapped")?;
        self.check_fits(bytes.len())?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        Ok(())
    }

    /// Copy `data` to the start of a host-visible buffer, mapping it for the
    /// duration of the copy unless it is already mapped.
    pub unsafe fn write<T: Pod>(&self, device: &ash::Device, data: &[T]) -> Result<()> {
        if self.mapped.is_some() {
            return self.write_mapped(data);
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Ok(());
        }
        self.check_fits(bytes.len())?;
        let ptr = device
            .map_memory(
                self.memory,
                0,
                bytes.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )
            .context("map_memory")?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
        device.unmap_memory(self.memory);
        Ok(())
    }

    fn check_fits(&self, len: usize) -> Result<()> {
        ensure!(
            len as vk::DeviceSize <= self.size,
            "write of {len} bytes into {}-byte buffer",
            self.size
        );
        Ok(())
    }

    pub unsafe fn destroy(self, device: &ash::Device, ledger: &mut ResourceLedger) {
        if self.mapped.is_some() {
            device.unmap_memory(self.memory);
        }
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
        ledger.destroyed(ResourceKind::Buffer);
        ledger.destroyed(ResourceKind::Memory);
    }
}

pub unsafe fn create_buffer(
    ctx: &GpuContext,
    ledger: &mut ResourceLedger,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    required: vk::MemoryPropertyFlags,
) -> Result<GpuBuffer> {
    let device = &ctx.device;
    let bci = vk::BufferCreateInfo {
        s_type: vk::StructureType::BUFFER_CREATE_INFO,
        size,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let buffer = device.create_buffer(&bci, None).context("create_buffer")?;

    let req = device.get_buffer_memory_requirements(buffer);
    let memory_type_index = match find_memory_type(&ctx.mem_props, req.memory_type_bits, required) {
        Ok(i) => i,
        Err(e) => {
            device.destroy_buffer(buffer, None);
            return Err(e.into());
        }
    };
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index,
        ..Default::default()
    };
    let memory = match device.allocate_memory(&mai, None) {
        Ok(m) => m,
        Err(e) => {
            device.destroy_buffer(buffer, None);
            return Err(anyhow::Error::new(e).context("allocate_memory"));
        }
    };
    if let Err(e) = device.bind_buffer_memory(buffer, memory, 0) {
        device.destroy_buffer(buffer, None);
        device.free_memory(memory, None);
        return Err(anyhow::Error::new(e).context("bind_buffer_memory"));
    }

    ledger.created(ResourceKind::Buffer);
    ledger.created(ResourceKind::Memory);
    Ok(GpuBuffer {
        buffer,
        memory,
        size,
        mapped: None,
    })
}

/// Device-local buffer filled from `data` through a transient staging buffer.
/// Blocks until the copy has finished on the queue. On failure nothing
/// created here outlives the call.
pub unsafe fn upload_via_staging(
    ctx: &GpuContext,
    ledger: &mut ResourceLedger,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<GpuBuffer> {
    let size = data.len() as vk::DeviceSize;
    ensure!(size > 0, "staged upload of zero bytes");

    let dst = create_buffer(
        ctx,
        ledger,
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    if let Err(e) = fill_via_staging(ctx, ledger, &dst, data) {
        dst.destroy(&ctx.device, ledger);
        return Err(e);
    }
    debug!(bytes = size, ?usage, "uploaded device-local buffer");
    Ok(dst)
}

unsafe fn fill_via_staging(
    ctx: &GpuContext,
    ledger: &mut ResourceLedger,
    dst: &GpuBuffer,
    data: &[u8],
) -> Result<()> {
    let staging = create_buffer(
        ctx,
        ledger,
        dst.size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    let copied = match staging.write(&ctx.device, data) {
        Ok(()) => copy_once(ctx, ledger, &staging, dst),
        Err(e) => Err(e),
    };
    staging.destroy(&ctx.device, ledger);
    copied
}

/// One-shot `src -> dst` copy on the graphics queue.
unsafe fn copy_once(
    ctx: &GpuContext,
    ledger: &mut ResourceLedger,
    src: &GpuBuffer,
    dst: &GpuBuffer,
) -> Result<()> {
    let device = &ctx.device;
    let ai = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: ctx.cmd_pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmd = device
        .allocate_command_buffers(&ai)
        .context("allocate_command_buffers(upload)")?
        .into_iter()
        .next()
        .context("driver returned no command buffer")?;
    ledger.created(ResourceKind::CommandBuffer);

    let submitted = record_and_submit(ctx, cmd, src, dst);
    if submitted.is_err() {
        // The copy may have reached the queue before failing.
        device.queue_wait_idle(ctx.queue).ok();
    }
    device.free_command_buffers(ctx.cmd_pool, std::slice::from_ref(&cmd));
    ledger.destroyed(ResourceKind::CommandBuffer);
    submitted
}

unsafe fn record_and_submit(
    ctx: &GpuContext,
    cmd: vk::CommandBuffer,
    src: &GpuBuffer,
    dst: &GpuBuffer,
) -> Result<()> {
    let device = &ctx.device;
    let bi = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    device
        .begin_command_buffer(cmd, &bi)
        .context("begin_command_buffer(upload)")?;
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: dst.size,
    };
    device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, std::slice::from_ref(&region));
    device
        .end_command_buffer(cmd)
        .context("end_command_buffer(upload)")?;

    let si = vk::SubmitInfo {
        s_type: vk::StructureType::SUBMIT_INFO,
        command_buffer_count: 1,
        p_command_buffers: &cmd,
        ..Default::default()
    };
    device
        .queue_submit(ctx.queue, std::slice::from_ref(&si), vk::Fence::null())
        .context("queue_submit(upload)")?;
    device
        .queue_wait_idle(ctx.queue)
        .context("queue_wait_idle(upload)")
}
