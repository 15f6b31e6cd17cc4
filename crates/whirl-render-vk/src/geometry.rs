// SPDX-License-Identifier: CEPL-1.0
//! Static geometry: a fan of five coloured blades around the origin.
use std::mem::{offset_of, size_of};

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::context::GpuContext;
use crate::ledger::ResourceLedger;
use crate::memory::{upload_via_staging, GpuBuffer};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub col: [f32; 4],
}

const fn v(x: f32, y: f32, r: f32, g: f32, b: f32) -> Vertex {
    Vertex {
        pos: [x, y],
        col: [r, g, b, 1.0],
    }
}

pub const VERTICES: [Vertex; 11] = [
    v(0.0, 0.0, 0.0, 0.0, 0.0),
    v(0.5, 0.7, 0.0, 1.0, 0.0),
    v(0.7, 0.5, 0.0, 1.0, 0.0),
    v(-0.5, -0.7, 0.0, 0.0, 1.0),
    v(-0.7, -0.5, 0.0, 0.0, 1.0),
    v(0.5, -0.7, 1.0, 0.0, 0.0),
    v(0.7, -0.5, 1.0, 0.0, 0.0),
    v(-0.5, 0.7, 1.0, 1.0, 0.0),
    v(-0.7, 0.5, 1.0, 1.0, 0.0),
    v(-0.5, -0.7, 1.0, 1.0, 1.0),
    v(0.5, -0.7, 1.0, 1.0, 1.0),
];

pub const INDICES: [u16; 15] = [0, 1, 2, 0, 3, 4, 0, 5, 6, 0, 7, 8, 0, 9, 10];

impl Vertex {
    pub fn binding() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attributes() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: offset_of!(Vertex, col) as u32,
            },
        ]
    }
}

/// Device-local vertex and index buffers, uploaded once.
#[derive(Debug)]
pub struct Geometry {
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub index_count: u32,
}

impl Geometry {
    pub unsafe fn upload(ctx: &GpuContext, ledger: &mut ResourceLedger) -> Result<Self> {
        let vertices = upload_via_staging(
            ctx,
            ledger,
            bytemuck::cast_slice(&VERTICES),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let indices = match upload_via_staging(
            ctx,
            ledger,
            bytemuck::cast_slice(&INDICES),
            vk::BufferUsageFlags::INDEX_BUFFER,
        ) {
            Ok(b) => b,
            Err(e) => {
                vertices.destroy(&ctx.device, ledger);
                return Err(e);
            }
        };
        Ok(Self {
            vertices,
            indices,
            index_count: INDICES.len() as u32,
        })
    }

    pub unsafe fn destroy(self, device: &ash::Device, ledger: &mut ResourceLedger) {
        self.vertices.destroy(device, ledger);
        self.indices.destroy(device, ledger);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_stay_in_range() {
        assert!(INDICES.iter().all(|&i| (i as usize) < VERTICES.len()));
        assert_eq!(INDICES.len() % 3, 0);
    }

    #[test]
    fn every_triangle_fans_from_the_centre() {
        for tri in INDICES.chunks(3) {
            assert_eq!(tri[0], 0);
        }
        assert_eq!(VERTICES[0].pos, [0.0, 0.0]);
    }

    #[test]
    fn vertices_are_opaque() {
        assert!(VERTICES.iter().all(|v| v.col[3] == 1.0));
    }

    #[test]
    fn layout_matches_attribute_formats() {
        assert_eq!(Vertex::binding().stride, 24);
        let [pos, col] = Vertex::attributes();
        assert_eq!(pos.offset, 0);
        assert_eq!(col.offset, 8);
        assert_eq!(bytemuck::cast_slice::<Vertex, u8>(&VERTICES).len(), 11 * 24);
    }
}
