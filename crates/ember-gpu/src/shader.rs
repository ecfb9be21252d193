//! Shader modules from SPIR-V.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CStr;
use std::io::Cursor;

/// Entry point every stage is compiled with.
pub const ENTRY_POINT: &CStr = c"main";

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Pipeline stage a module is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Vertex,
    Fragment,
    Compute,
    RayGeneration,
    ClosestHit,
    Miss,
}

impl ShaderKind {
    pub fn stage_flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
            Self::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            Self::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            Self::Miss => vk::ShaderStageFlags::MISS_KHR,
        }
    }
}

/// Decode SPIR-V bytes into words, fixing endianness.
pub fn decode_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| GpuError::ShaderModule(format!("Invalid SPIR-V: {e}")))?;

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&other) => Err(GpuError::ShaderModule(format!(
            "Invalid SPIR-V magic number {other:#010x}"
        ))),
        None => Err(GpuError::ShaderModule("Empty SPIR-V blob".to_string())),
    }
}

/// A compiled module tagged with the stage it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderStage {
    pub kind: ShaderKind,
    pub module: vk::ShaderModule,
}

impl ShaderStage {
    /// Build a module from SPIR-V bytes.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn from_spirv(device: &ash::Device, kind: ShaderKind, bytes: &[u8]) -> Result<Self> {
        let code = decode_spirv(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = device
            .create_shader_module(&create_info, None)
            .map_err(|e| GpuError::ShaderModule(format!("{kind:?}: {e}")))?;

        Ok(Self { kind, module })
    }

    pub fn create_info(&self) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.kind.stage_flags())
            .module(self.module)
            .name(ENTRY_POINT)
    }

    /// Destroy the module. Pipelines built from it stay valid.
    ///
    /// # Safety
    /// No pipeline creation using this module may be in progress.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_shader_module(self.module, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(magic: u32) -> Vec<u8> {
        [magic, 0x0001_0500, 0, 1, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    #[test]
    fn decodes_little_endian_words() {
        let words = decode_spirv(&header(SPIRV_MAGIC)).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn rejects_unaligned_length() {
        let mut bytes = header(SPIRV_MAGIC);
        bytes.push(0);
        assert!(matches!(decode_spirv(&bytes), Err(GpuError::ShaderModule(_))));
    }

    #[test]
    fn rejects_wrong_magic() {
        assert!(matches!(
            decode_spirv(&header(0xDEAD_BEEF)),
            Err(GpuError::ShaderModule(_))
        ));
    }

    #[test]
    fn rejects_empty_blob() {
        assert!(decode_spirv(&[]).is_err());
    }

    #[test]
    fn stage_info_uses_main_entry_point() {
        let stage = ShaderStage {
            kind: ShaderKind::ClosestHit,
            module: vk::ShaderModule::null(),
        };
        let info = stage.create_info();
        assert_eq!(info.stage, vk::ShaderStageFlags::CLOSEST_HIT_KHR);
        assert_eq!(unsafe { CStr::from_ptr(info.p_name) }, c"main");
    }
}
