// SPDX-License-Identifier: CEPL-1.0
//! SPIR-V loading from the shader directory.
use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use ash::util::read_spv;
use ash::vk;
use tracing::debug;

use crate::error::RenderError;
use crate::ledger::{ResourceKind, ResourceLedger};

pub const VERTEX_SPV: &str = "shader.vert.spv";
pub const FRAGMENT_SPV: &str = "shader.frag.spv";

/// Read a SPIR-V file into words. The byte length must be a multiple of 4.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>, RenderError> {
    let bytes = std::fs::read(path).map_err(|source| RenderError::ShaderIo {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.len() % 4 != 0 {
        return Err(RenderError::UnalignedBytecode {
            path: path.to_path_buf(),
            len: bytes.len(),
        });
    }
    read_spv(&mut Cursor::new(&bytes[..])).map_err(|source| RenderError::ShaderIo {
        path: path.to_path_buf(),
        source,
    })
}

/// Vertex and fragment bytecode, loaded once and reused on every recreate.
#[derive(Clone, Debug)]
pub struct ShaderCode {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderCode {
    pub fn load(dir: &Path) -> Result<Self> {
        let vertex = load_spirv(&dir.join(VERTEX_SPV))?;
        let fragment = load_spirv(&dir.join(FRAGMENT_SPV))?;
        debug!(
            dir = %dir.display(),
            vertex_words = vertex.len(),
            fragment_words = fragment.len(),
            "loaded shader bytecode"
        );
        Ok(Self { vertex, fragment })
    }
}

pub unsafe fn create_shader_module(
    device: &ash::Device,
    ledger: &mut ResourceLedger,
    code: &[u32],
) -> Result<vk::ShaderModule> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    let module = device
        .create_shader_module(&ci, None)
        .context("create_shader_module")?;
    ledger.created(ResourceKind::ShaderModule);
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(name: &str, bytes: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("whirl-shader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn word_aligned_bytecode_loads() {
        let mut bytes = Vec::new();
        for word in [0x0723_0203_u32, 0x0001_0000, 0, 8, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let path = temp_file("aligned.spv", &bytes);
        let words = load_spirv(&path).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn unaligned_bytecode_is_rejected() {
        let path = temp_file("unaligned.spv", &[0x03, 0x02, 0x23, 0x07, 0x00, 0x00]);
        match load_spirv(&path) {
            Err(RenderError::UnalignedBytecode { len, .. }) => assert_eq!(len, 6),
            other => panic!("expected UnalignedBytecode, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let path = std::env::temp_dir().join("whirl-does-not-exist").join("nope.spv");
        assert!(matches!(load_spirv(&path), Err(RenderError::ShaderIo { .. })));
    }

    #[test]
    fn bundled_shaders_load() {
        let code = ShaderCode::load(Path::new(crate::DEFAULT_SHADER_DIR)).unwrap();
        assert!(!code.vertex.is_empty());
        assert!(!code.fragment.is_empty());
        assert_eq!(code.vertex[0], 0x0723_0203);
    }
}
