//! Command buffer management.

use crate::error::Result;
use ash::vk;
use std::collections::HashMap;

/// Command pool for allocating command buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;
        tracing::debug!("Created command pool for queue family {}", queue_family);

        Ok(Self { pool, queue_family })
    }

    #[cfg(test)]
    pub(crate) fn from_raw(pool: vk::CommandPool, queue_family: u32) -> Self {
        Self { pool, queue_family }
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Primary-level allocation of `count` buffers from this pool.
    pub fn allocate_info(&self, count: u32) -> vk::CommandBufferAllocateInfo<'static> {
        vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count)
    }

    /// Allocate `count` primary command buffers, each carrying `usage`.
    /// A count of zero allocates nothing.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffers(
        &self,
        device: &ash::Device,
        count: u32,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<Vec<CommandBuffer>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let buffers = device.allocate_command_buffers(&self.allocate_info(count))?;
        Ok(buffers
            .into_iter()
            .map(|handle| CommandBuffer { handle, usage })
            .collect())
    }

    /// Return buffers to the pool.
    ///
    /// # Safety
    /// The buffers must come from this pool and must not be pending.
    pub unsafe fn free_command_buffers(&self, device: &ash::Device, buffers: &[CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        let handles: Vec<vk::CommandBuffer> = buffers.iter().map(|b| b.handle).collect();
        device.free_command_buffers(self.pool, &handles);
    }

    /// Reset the command pool, returning every buffer allocated from it to
    /// the initial state.
    ///
    /// # Safety
    /// The device must be valid and all command buffers from this pool must not be in use.
    pub unsafe fn reset(
        &self,
        device: &ash::Device,
        flags: vk::CommandPoolResetFlags,
    ) -> Result<()> {
        device.reset_command_pool(self.pool, flags)?;
        Ok(())
    }

    /// Destroy the command pool, freeing every buffer allocated from it.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// A primary command buffer and the usage it should be begun with.
///
/// Allocation does not begin recording; call [`CommandBuffer::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBuffer {
    pub handle: vk::CommandBuffer,
    pub usage: vk::CommandBufferUsageFlags,
}

impl CommandBuffer {
    pub fn begin_info(&self) -> vk::CommandBufferBeginInfo<'static> {
        vk::CommandBufferBeginInfo::default().flags(self.usage)
    }

    /// Begin recording with the stored usage flags.
    ///
    /// # Safety
    /// The device must own this buffer and the buffer must not be pending.
    pub unsafe fn begin(&self, device: &ash::Device) -> Result<()> {
        device.begin_command_buffer(self.handle, &self.begin_info())?;
        Ok(())
    }

    /// # Safety
    /// The buffer must be recording.
    pub unsafe fn end(&self, device: &ash::Device) -> Result<()> {
        device.end_command_buffer(self.handle)?;
        Ok(())
    }
}

/// Command pools keyed by queue family; at most one per family.
#[derive(Default)]
pub struct CommandPoolCache {
    pools: HashMap<u32, CommandPool>,
}

impl CommandPoolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool for `family`, created by `create` on first request.
    pub fn get_or_create_with<F>(&mut self, family: u32, create: F) -> Result<CommandPool>
    where
        F: FnOnce(u32) -> Result<CommandPool>,
    {
        if let Some(pool) = self.pools.get(&family) {
            return Ok(*pool);
        }

        let pool = create(family)?;
        self.pools.insert(family, pool);
        Ok(pool)
    }

    /// The pool for `family`, if one was created.
    pub fn get(&self, family: u32) -> Option<CommandPool> {
        self.pools.get(&family).copied()
    }

    /// The pool for `family`, creating it on `device` if needed.
    ///
    /// # Safety
    /// The device must be valid and `family` must exist on it.
    pub unsafe fn get_or_create(&mut self, device: &ash::Device, family: u32) -> Result<CommandPool> {
        self.get_or_create_with(family, |family| {
            CommandPool::new(device, family, vk::CommandPoolCreateFlags::empty())
        })
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Destroy every pool.
    ///
    /// # Safety
    /// No command buffer from any pool may be pending.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for (_, pool) in self.pools.drain() {
            pool.destroy(device);
        }
    }
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    device.queue_submit(queue, &[submit_info], fence)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn same_family_returns_the_same_pool() {
        let mut cache = CommandPoolCache::new();
        let mut created = 0;

        let mut create = |family: u32| {
            created += 1;
            Ok(CommandPool::from_raw(
                vk::CommandPool::from_raw(100 + u64::from(family)),
                family,
            ))
        };

        let first = cache.get_or_create_with(0, &mut create).unwrap();
        let second = cache.get_or_create_with(0, &mut create).unwrap();
        let other = cache.get_or_create_with(2, &mut create).unwrap();

        assert_eq!(first, second);
        assert_ne!(first.handle(), other.handle());
        assert_eq!(other.queue_family(), 2);
        assert_eq!(created, 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn lookup_does_not_create() {
        let mut cache = CommandPoolCache::new();
        assert!(cache.get(0).is_none());

        let pool = cache
            .get_or_create_with(0, |family| {
                Ok(CommandPool::from_raw(vk::CommandPool::from_raw(5), family))
            })
            .unwrap();

        assert_eq!(cache.get(0), Some(pool));
        assert!(cache.get(1).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn allocate_info_targets_the_pool() {
        let pool = CommandPool::from_raw(vk::CommandPool::from_raw(5), 0);
        let info = pool.allocate_info(3);

        assert_eq!(info.command_pool, vk::CommandPool::from_raw(5));
        assert_eq!(info.level, vk::CommandBufferLevel::PRIMARY);
        assert_eq!(info.command_buffer_count, 3);
    }

    #[test]
    fn failed_creation_is_not_cached() {
        let mut cache = CommandPoolCache::new();

        let result = cache.get_or_create_with(1, |_| {
            Err(crate::error::GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn begin_info_carries_usage() {
        let buffer = CommandBuffer {
            handle: vk::CommandBuffer::from_raw(7),
            usage: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        };
        assert_eq!(
            buffer.begin_info().flags,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        );
    }
}
