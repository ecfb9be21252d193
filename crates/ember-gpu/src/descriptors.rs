//! Descriptor set management.
//!
//! The session shares one fixed-capacity pool across every allocation. The
//! pool tracks what it has handed out so an over-capacity request fails up
//! front with [`GpuError::DescriptorPoolExhausted`] instead of growing.

use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashMap;

/// Descriptor count per type for one set.
pub type DescriptorCounts = HashMap<vk::DescriptorType, u32>;

/// Sets the shared pool can hold.
pub const DEFAULT_MAX_SETS: u32 = 128;

/// Descriptors of each pooled type the shared pool can hold.
pub const DEFAULT_DESCRIPTORS_PER_TYPE: u32 = 128;

/// Pool sizes for the shared pool.
///
/// Acceleration structures are pooled only when ray tracing is enabled.
pub fn default_pool_sizes(ray_tracing: bool) -> Vec<vk::DescriptorPoolSize> {
    let mut types = vec![
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::DescriptorType::STORAGE_IMAGE,
    ];
    if ray_tracing {
        types.push(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
    }

    types
        .into_iter()
        .map(|ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: DEFAULT_DESCRIPTORS_PER_TYPE,
        })
        .collect()
}

/// A descriptor set layout that remembers how many descriptors it holds.
#[derive(Debug, Clone)]
pub struct DescriptorSetLayout {
    pub handle: vk::DescriptorSetLayout,
    pub counts: DescriptorCounts,
}

impl DescriptorSetLayout {
    /// # Safety
    /// No pipeline layout or pending allocation may still use the layout.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_set_layout(self.handle, None);
    }
}

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    /// Add a sampled image binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Add an acceleration structure binding (for ray tracing).
    pub fn acceleration_structure(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            stage_flags,
        )
    }

    /// Per-type totals over the bindings added so far.
    pub fn counts(&self) -> DescriptorCounts {
        let mut counts = DescriptorCounts::new();
        for binding in &self.bindings {
            *counts.entry(binding.descriptor_type).or_insert(0) += binding.descriptor_count;
        }
        counts
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<DescriptorSetLayout> {
        let counts = self.counts();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let handle = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(DescriptorSetLayout { handle, counts })
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Capacity still available in a descriptor pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorBudget {
    remaining_sets: u32,
    remaining: DescriptorCounts,
}

/// What a pending allocation will take out of a [`DescriptorBudget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    sets: u32,
    counts: DescriptorCounts,
}

impl DescriptorBudget {
    pub fn new(max_sets: u32, pool_sizes: &[vk::DescriptorPoolSize]) -> Self {
        let mut remaining = DescriptorCounts::new();
        for size in pool_sizes {
            *remaining.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        Self {
            remaining_sets: max_sets,
            remaining,
        }
    }

    pub fn remaining_sets(&self) -> u32 {
        self.remaining_sets
    }

    /// Descriptors of `ty` still available.
    pub fn remaining(&self, ty: vk::DescriptorType) -> u32 {
        self.remaining.get(&ty).copied().unwrap_or(0)
    }

    /// Check that one set per layout fits, without taking anything.
    pub fn plan(&self, layouts: &[&DescriptorSetLayout]) -> Result<Reservation> {
        let sets = u32::try_from(layouts.len()).map_err(|_| {
            GpuError::DescriptorPoolExhausted(format!("requested {} sets", layouts.len()))
        })?;
        if sets > self.remaining_sets {
            return Err(GpuError::DescriptorPoolExhausted(format!(
                "requested {} sets, {} remaining",
                sets, self.remaining_sets
            )));
        }

        let mut counts = DescriptorCounts::new();
        for layout in layouts {
            for (&ty, &count) in &layout.counts {
                *counts.entry(ty).or_insert(0) += count;
            }
        }

        for (&ty, &count) in &counts {
            let available = self.remaining(ty);
            if count > available {
                return Err(GpuError::DescriptorPoolExhausted(format!(
                    "requested {count} descriptors of type {ty:?}, {available} remaining"
                )));
            }
        }

        Ok(Reservation { sets, counts })
    }

    /// Take a planned reservation out of the budget.
    pub fn commit(&mut self, reservation: Reservation) {
        self.remaining_sets -= reservation.sets;
        for (ty, count) in reservation.counts {
            if let Some(remaining) = self.remaining.get_mut(&ty) {
                *remaining -= count;
            }
        }
    }

    /// Plan and commit in one step.
    pub fn reserve(&mut self, layouts: &[&DescriptorSetLayout]) -> Result<()> {
        let reservation = self.plan(layouts)?;
        self.commit(reservation);
        Ok(())
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    budget: DescriptorBudget,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// Sets are never freed individually; the pool is released as a whole.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        tracing::debug!("Created descriptor pool with {} sets", max_sets);

        Ok(Self {
            pool,
            budget: DescriptorBudget::new(max_sets, pool_sizes),
        })
    }

    /// The shared pool with default capacity.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn with_defaults(device: &ash::Device, ray_tracing: bool) -> Result<Self> {
        Self::new(device, DEFAULT_MAX_SETS, &default_pool_sizes(ray_tracing))
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn budget(&self) -> &DescriptorBudget {
        &self.budget
    }

    /// Allocate one descriptor set per layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &mut self,
        device: &ash::Device,
        layouts: &[&DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let reservation = self.budget.plan(layouts)?;
        if layouts.is_empty() {
            return Ok(Vec::new());
        }

        let handles: Vec<vk::DescriptorSetLayout> = layouts.iter().map(|l| l.handle).collect();
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&handles);

        let sets = device
            .allocate_descriptor_sets(&alloc_info)
            .map_err(|e| match e {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    GpuError::DescriptorPoolExhausted(e.to_string())
                }
                other => GpuError::Vulkan(other),
            })?;

        self.budget.commit(reservation);
        Ok(sets)
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

/// Write a uniform buffer descriptor.
///
/// # Safety
/// Device and buffer must be valid.
pub unsafe fn write_uniform_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    offset: u64,
    range: u64,
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(std::slice::from_ref(&buffer_info));

    device.update_descriptor_sets(&[write], &[]);
}

/// Write a storage image descriptor.
///
/// # Safety
/// Device and image view must be valid.
pub unsafe fn write_storage_image(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    image_view: vk::ImageView,
    layout: vk::ImageLayout,
) {
    let image_info = vk::DescriptorImageInfo::default()
        .image_view(image_view)
        .image_layout(layout);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
        .image_info(std::slice::from_ref(&image_info));

    device.update_descriptor_sets(&[write], &[]);
}

/// Write a combined image sampler descriptor.
///
/// # Safety
/// Device, sampler and image view must be valid.
pub unsafe fn write_combined_image_sampler(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    sampler: vk::Sampler,
    image_view: vk::ImageView,
) {
    let image_info = vk::DescriptorImageInfo::default()
        .sampler(sampler)
        .image_view(image_view)
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(std::slice::from_ref(&image_info));

    device.update_descriptor_sets(&[write], &[]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(builder: DescriptorSetLayoutBuilder<'_>) -> DescriptorSetLayout {
        DescriptorSetLayout {
            handle: vk::DescriptorSetLayout::null(),
            counts: builder.counts(),
        }
    }

    #[test]
    fn builder_records_per_type_counts() {
        let builder = DescriptorSetLayoutBuilder::new()
            .storage_image(0, vk::ShaderStageFlags::RAYGEN_KHR)
            .acceleration_structure(1, vk::ShaderStageFlags::RAYGEN_KHR)
            .uniform_buffer(2, vk::ShaderStageFlags::RAYGEN_KHR)
            .uniform_buffer(3, vk::ShaderStageFlags::CLOSEST_HIT_KHR);

        let counts = builder.counts();
        assert_eq!(counts[&vk::DescriptorType::UNIFORM_BUFFER], 2);
        assert_eq!(counts[&vk::DescriptorType::STORAGE_IMAGE], 1);
        assert_eq!(counts[&vk::DescriptorType::ACCELERATION_STRUCTURE_KHR], 1);
        assert!(!counts.contains_key(&vk::DescriptorType::COMBINED_IMAGE_SAMPLER));
    }

    #[test]
    fn in_capacity_requests_reduce_the_budget() {
        let mut budget = DescriptorBudget::new(DEFAULT_MAX_SETS, &default_pool_sizes(true));
        let camera = layout(
            DescriptorSetLayoutBuilder::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX),
        );

        budget.reserve(&[&camera, &camera]).unwrap();

        assert_eq!(budget.remaining_sets(), 126);
        assert_eq!(budget.remaining(vk::DescriptorType::UNIFORM_BUFFER), 126);
        assert_eq!(budget.remaining(vk::DescriptorType::STORAGE_IMAGE), 128);
    }

    #[test]
    fn too_many_descriptors_fail_without_side_effects() {
        let mut budget = DescriptorBudget::new(DEFAULT_MAX_SETS, &default_pool_sizes(true));
        let wide = layout(DescriptorSetLayoutBuilder::new().binding(
            0,
            vk::DescriptorType::STORAGE_IMAGE,
            100,
            vk::ShaderStageFlags::COMPUTE,
        ));

        budget.reserve(&[&wide]).unwrap();
        let before = budget.clone();

        let err = budget.reserve(&[&wide]).unwrap_err();
        assert!(matches!(err, GpuError::DescriptorPoolExhausted(_)));
        assert_eq!(budget, before);
    }

    #[test]
    fn too_many_sets_fail() {
        let mut budget = DescriptorBudget::new(2, &default_pool_sizes(true));
        let empty = layout(DescriptorSetLayoutBuilder::new());

        let err = budget.reserve(&[&empty, &empty, &empty]).unwrap_err();
        assert!(matches!(err, GpuError::DescriptorPoolExhausted(_)));
        assert_eq!(budget.remaining_sets(), 2);
    }

    #[test]
    fn acceleration_structures_only_with_ray_tracing() {
        let has_as = |sizes: &[vk::DescriptorPoolSize]| {
            sizes
                .iter()
                .any(|size| size.ty == vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
        };

        assert!(!has_as(&default_pool_sizes(false)));
        assert!(has_as(&default_pool_sizes(true)));
        assert_eq!(default_pool_sizes(false).len(), 3);

        let budget = DescriptorBudget::new(DEFAULT_MAX_SETS, &default_pool_sizes(false));
        let tlas = layout(
            DescriptorSetLayoutBuilder::new().acceleration_structure(0, vk::ShaderStageFlags::RAYGEN_KHR),
        );
        assert!(matches!(
            budget.plan(&[&tlas]),
            Err(GpuError::DescriptorPoolExhausted(_))
        ));
    }

    #[test]
    fn empty_request_takes_nothing() {
        let mut budget = DescriptorBudget::new(4, &default_pool_sizes(false));
        let before = budget.clone();

        budget.reserve(&[]).unwrap();
        assert_eq!(budget, before);
    }

    #[test]
    fn unpooled_types_are_rejected() {
        let budget = DescriptorBudget::new(DEFAULT_MAX_SETS, &default_pool_sizes(true));
        let storage_buffer = layout(DescriptorSetLayoutBuilder::new().binding(
            0,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            vk::ShaderStageFlags::COMPUTE,
        ));

        assert!(matches!(
            budget.plan(&[&storage_buffer]),
            Err(GpuError::DescriptorPoolExhausted(_))
        ));
    }
}
