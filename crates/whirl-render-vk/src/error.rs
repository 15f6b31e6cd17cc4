// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

/// Unrecoverable configuration or driver faults. Stale surfaces are not errors
/// and never show up here.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no memory type matches bits {type_bits:#x} with properties {required:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("surface does not offer required present mode {0:?}")]
    PresentModeUnavailable(vk::PresentModeKHR),

    #[error("surface reports no formats")]
    NoSurfaceFormat,

    #[error("shader bytecode {path} is {len} bytes, not a multiple of 4")]
    UnalignedBytecode { path: PathBuf, len: usize },

    #[error("failed to read shader bytecode {path}")]
    ShaderIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no physical device can render and present to this surface")]
    NoSuitableDevice,

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
}
