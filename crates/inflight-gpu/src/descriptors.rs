//! Descriptor set management.
//!
//! [`DescriptorPoolAllocator`] hands out two kinds of sets:
//!
//! - per-frame uniform-buffer sets from one pool sized to exactly
//!   `max_frames_in_flight` sets, which must never be over-asked;
//! - combined-image-sampler sets from a growing list of fixed-capacity pools.
//!
//! Image pools live in two partitions, *available* (some capacity left) and
//! *full*. Allocation draws from the most recently pushed available pool and
//! creates a new pool only when none is available. Pools are never destroyed
//! before the allocator itself.

use crate::device::{DescriptorWrite, GpuDevice};
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// Sets per image-sampler pool unless configured otherwise.
pub const DEFAULT_IMAGE_POOL_CAPACITY: u32 = 10;

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

    /// Add a sampled image binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Number of bindings added so far.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no binding was added.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Build the descriptor set layout.
    pub fn build(self, device: &dyn GpuDevice) -> Result<vk::DescriptorSetLayout> {
        device.create_descriptor_set_layout(&self.bindings)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor allocator configuration.
#[derive(Debug, Clone)]
pub struct DescriptorAllocatorConfig {
    /// Capacity of the uniform-buffer set pool.
    pub max_frames_in_flight: u32,
    /// Uniform buffer descriptors in each buffer set.
    pub uniform_bindings_per_set: u32,
    /// Sets per image-sampler pool.
    pub image_pool_capacity: u32,
    /// Combined image sampler descriptors in each image set.
    pub samplers_per_set: u32,
}

impl Default for DescriptorAllocatorConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            uniform_bindings_per_set: 2,
            image_pool_capacity: DEFAULT_IMAGE_POOL_CAPACITY,
            samplers_per_set: 1,
        }
    }
}

impl DescriptorAllocatorConfig {
    /// Size the buffer-set pool for `frames` frames in flight.
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Set the number of uniform buffer bindings per buffer set.
    pub fn with_uniform_bindings_per_set(mut self, bindings: u32) -> Self {
        self.uniform_bindings_per_set = bindings;
        self
    }

    /// Set how many image sets each image pool holds.
    pub fn with_image_pool_capacity(mut self, capacity: u32) -> Self {
        self.image_pool_capacity = capacity;
        self
    }

    /// Set the number of samplers per image set.
    pub fn with_samplers_per_set(mut self, samplers: u32) -> Self {
        self.samplers_per_set = samplers;
        self
    }
}

/// A descriptor set and the pool that owns it.
///
/// Image sets must be handed back through
/// [`DescriptorPoolAllocator::free_image_set`] before the allocator is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSetHandle {
    pub set: vk::DescriptorSet,
    pub pool: vk::DescriptorPool,
}

/// A pool and how many sets it can still hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    pub pool: vk::DescriptorPool,
    pub remaining: u32,
}

/// Capacity bookkeeping for image-sampler pools.
///
/// Every pool is in exactly one of `available` (`remaining > 0`) or `full`
/// (`remaining == 0`).
#[derive(Debug, Clone)]
pub struct ImagePoolPartitions {
    capacity: u32,
    available: Vec<PoolInfo>,
    full: Vec<PoolInfo>,
}

impl ImagePoolPartitions {
    /// Empty partitions for pools of `capacity` sets.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            available: Vec::new(),
            full: Vec::new(),
        }
    }

    /// Sets per pool.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The pool the next allocation draws from: the tail of `available`.
    pub fn next_pool(&self) -> Option<vk::DescriptorPool> {
        self.available.last().map(|info| info.pool)
    }

    /// Register a freshly created pool at the tail of `available`.
    pub fn push_pool(&mut self, pool: vk::DescriptorPool) {
        self.available.push(PoolInfo {
            pool,
            remaining: self.capacity,
        });
    }

    /// Account for one set taken from the tail pool, moving it to `full` when
    /// its capacity reaches zero.
    pub fn record_allocation(&mut self) -> Result<vk::DescriptorPool> {
        let info = self
            .available
            .last_mut()
            .ok_or_else(|| GpuError::InvalidState("No available image pool".to_string()))?;
        info.remaining -= 1;
        let pool = info.pool;

        if info.remaining == 0 {
            if let Some(exhausted) = self.available.pop() {
                self.full.push(exhausted);
            }
        }

        Ok(pool)
    }

    /// Account for one set returned to `pool`.
    ///
    /// The full partition is searched first; a pool found there moves back to
    /// the tail of `available`, so the next allocation reuses it.
    pub fn record_free(&mut self, pool: vk::DescriptorPool) -> Result<()> {
        if let Some(position) = self.full.iter().position(|info| info.pool == pool) {
            let mut info = self.full.remove(position);
            info.remaining += 1;
            self.available.push(info);
            return Ok(());
        }

        let info = self
            .available
            .iter_mut()
            .find(|info| info.pool == pool)
            .ok_or_else(|| {
                GpuError::ResourceNotFound(format!("Descriptor pool {pool:?} is not an image pool"))
            })?;

        if info.remaining >= self.capacity {
            return Err(GpuError::InvalidState(format!(
                "Descriptor pool {pool:?} has no outstanding sets"
            )));
        }
        info.remaining += 1;
        Ok(())
    }

    /// Remaining capacity of `pool`, if it is tracked here.
    pub fn remaining(&self, pool: vk::DescriptorPool) -> Option<u32> {
        self.pools()
            .find(|info| info.pool == pool)
            .map(|info| info.remaining)
    }

    /// Every tracked pool, available ones first.
    pub fn pools(&self) -> impl Iterator<Item = &PoolInfo> {
        self.available.iter().chain(self.full.iter())
    }

    /// Pools with capacity left.
    pub fn available(&self) -> &[PoolInfo] {
        &self.available
    }

    /// Pools with no capacity left.
    pub fn full(&self) -> &[PoolInfo] {
        &self.full
    }

    /// Number of pools created so far.
    pub fn pool_count(&self) -> usize {
        self.available.len() + self.full.len()
    }

    /// Sets currently allocated across all pools.
    pub fn outstanding(&self) -> u32 {
        self.pools()
            .map(|info| self.capacity - info.remaining)
            .sum()
    }
}

/// Allocates uniform-buffer sets and image-sampler sets.
pub struct DescriptorPoolAllocator {
    device: Arc<dyn GpuDevice>,
    buffer_pool: PoolInfo,
    buffer_layout: vk::DescriptorSetLayout,
    image_layout: vk::DescriptorSetLayout,
    image_pools: ImagePoolPartitions,
    config: DescriptorAllocatorConfig,
}

impl DescriptorPoolAllocator {
    /// Create the buffer-set pool. Image pools are created on first demand.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        buffer_layout: vk::DescriptorSetLayout,
        image_layout: vk::DescriptorSetLayout,
        config: DescriptorAllocatorConfig,
    ) -> Result<Self> {
        if config.max_frames_in_flight == 0 || config.image_pool_capacity == 0 {
            return Err(GpuError::InvalidState(
                "Descriptor pool capacities must be non-zero".to_string(),
            ));
        }

        let pool_size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: config.uniform_bindings_per_set * config.max_frames_in_flight,
        };
        let pool = device.create_descriptor_pool(
            config.max_frames_in_flight,
            &[pool_size],
            vk::DescriptorPoolCreateFlags::empty(),
        )?;

        tracing::debug!(
            "Buffer descriptor pool created for {} sets",
            config.max_frames_in_flight
        );

        Ok(Self {
            device,
            buffer_pool: PoolInfo {
                pool,
                remaining: config.max_frames_in_flight,
            },
            buffer_layout,
            image_layout,
            image_pools: ImagePoolPartitions::new(config.image_pool_capacity),
            config,
        })
    }

    /// Allocate `count` uniform-buffer sets.
    ///
    /// Asking for more than the pool has left is a sizing bug and fails with
    /// `GpuError::PoolExhausted`.
    pub fn alloc_buffer_sets(&mut self, count: u32) -> Result<Vec<DescriptorSetHandle>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > self.buffer_pool.remaining {
            return Err(GpuError::PoolExhausted {
                requested: count,
                remaining: self.buffer_pool.remaining,
            });
        }

        let layouts = vec![self.buffer_layout; count as usize];
        let sets = self
            .device
            .allocate_descriptor_sets(self.buffer_pool.pool, &layouts)?;
        self.buffer_pool.remaining -= count;

        let pool = self.buffer_pool.pool;
        Ok(sets
            .into_iter()
            .map(|set| DescriptorSetHandle { set, pool })
            .collect())
    }

    /// Allocate one image-sampler set, creating a pool if none has capacity.
    pub fn alloc_image_set(&mut self) -> Result<DescriptorSetHandle> {
        let pool = match self.image_pools.next_pool() {
            Some(pool) => pool,
            None => self.add_image_pool()?,
        };

        let sets = self
            .device
            .allocate_descriptor_sets(pool, &[self.image_layout])?;
        let set = sets.into_iter().next().ok_or_else(|| {
            GpuError::Other("Device returned no descriptor set".to_string())
        })?;

        self.image_pools.record_allocation()?;
        Ok(DescriptorSetHandle { set, pool })
    }

    /// Return an image-sampler set to its pool.
    pub fn free_image_set(&mut self, handle: DescriptorSetHandle) -> Result<()> {
        // Validate before touching the device so a bad handle leaves both sides untouched
        match self.image_pools.remaining(handle.pool) {
            None => {
                return Err(GpuError::ResourceNotFound(format!(
                    "Descriptor pool {:?} is not an image pool",
                    handle.pool
                )));
            }
            Some(remaining) if remaining == self.config.image_pool_capacity => {
                return Err(GpuError::InvalidState(format!(
                    "Descriptor pool {:?} has no outstanding sets",
                    handle.pool
                )));
            }
            Some(_) => {}
        }

        self.device
            .free_descriptor_sets(handle.pool, &[handle.set])?;
        self.image_pools.record_free(handle.pool)
    }

    fn add_image_pool(&mut self) -> Result<vk::DescriptorPool> {
        let capacity = self.config.image_pool_capacity;
        let pool_size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: capacity * self.config.samplers_per_set,
        };
        let pool = self.device.create_descriptor_pool(
            capacity,
            &[pool_size],
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
        )?;
        self.image_pools.push_pool(pool);

        tracing::debug!(
            "Image descriptor pool #{} created ({capacity} sets)",
            self.image_pools.pool_count()
        );

        Ok(pool)
    }

    /// Uniform-buffer sets still available.
    pub fn buffer_sets_remaining(&self) -> u32 {
        self.buffer_pool.remaining
    }

    /// Number of image pools created so far.
    pub fn image_pool_count(&self) -> usize {
        self.image_pools.pool_count()
    }

    /// Image pools with capacity left.
    pub fn available_pool_count(&self) -> usize {
        self.image_pools.available().len()
    }

    /// Image pools with no capacity left.
    pub fn full_pool_count(&self) -> usize {
        self.image_pools.full().len()
    }

    /// Capacity of every image pool.
    pub fn image_pool_capacity(&self) -> u32 {
        self.image_pools.capacity()
    }

    /// Bookkeeping for every image pool.
    pub fn image_pools(&self) -> impl Iterator<Item = &PoolInfo> {
        self.image_pools.pools()
    }

    /// Image sets not yet freed.
    pub fn outstanding_image_sets(&self) -> u32 {
        self.image_pools.outstanding()
    }
}

impl Drop for DescriptorPoolAllocator {
    fn drop(&mut self) {
        let outstanding = self.image_pools.outstanding();
        if outstanding > 0 {
            tracing::warn!("Descriptor allocator dropped with {outstanding} image sets outstanding");
        }

        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Device wait before descriptor pool teardown failed: {e}");
        }

        self.device.destroy_descriptor_pool(self.buffer_pool.pool);
        for info in self.image_pools.pools() {
            self.device.destroy_descriptor_pool(info.pool);
        }
    }
}

/// Write a uniform buffer descriptor.
pub fn write_uniform_buffer(
    device: &dyn GpuDevice,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    offset: u64,
    range: u64,
) {
    device.update_descriptor_set(
        dst_set,
        binding,
        &DescriptorWrite::UniformBuffer {
            buffer,
            offset,
            range,
        },
    );
}

/// Write a combined image sampler descriptor for a shader-readable image.
pub fn write_combined_image_sampler(
    device: &dyn GpuDevice,
    dst_set: vk::DescriptorSet,
    binding: u32,
    sampler: vk::Sampler,
    image_view: vk::ImageView,
) {
    device.update_descriptor_set(
        dst_set,
        binding,
        &DescriptorWrite::CombinedImageSampler {
            sampler,
            image_view,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn pool(raw: u64) -> vk::DescriptorPool {
        vk::DescriptorPool::from_raw(raw)
    }

    fn assert_conserved(partitions: &ImagePoolPartitions, outstanding: &[(u64, u32)]) {
        for info in partitions.pools() {
            let allocated = outstanding
                .iter()
                .find(|(raw, _)| pool(*raw) == info.pool)
                .map_or(0, |(_, n)| *n);
            assert_eq!(info.remaining + allocated, partitions.capacity());
        }
        for info in partitions.available() {
            assert!(info.remaining > 0);
        }
        for info in partitions.full() {
            assert_eq!(info.remaining, 0);
        }
    }

    #[test]
    fn allocation_moves_exhausted_pool_to_full() {
        let mut partitions = ImagePoolPartitions::new(2);
        partitions.push_pool(pool(1));

        assert_eq!(partitions.record_allocation().unwrap(), pool(1));
        assert_eq!(partitions.available().len(), 1);

        assert_eq!(partitions.record_allocation().unwrap(), pool(1));
        assert!(partitions.available().is_empty());
        assert_eq!(partitions.full().len(), 1);
        assert_eq!(partitions.next_pool(), None);
    }

    #[test]
    fn free_from_full_pool_makes_it_next() {
        let mut partitions = ImagePoolPartitions::new(1);
        partitions.push_pool(pool(1));
        partitions.record_allocation().unwrap();
        partitions.push_pool(pool(2));
        partitions.record_allocation().unwrap();
        partitions.push_pool(pool(3));

        partitions.record_free(pool(1)).unwrap();

        assert_eq!(partitions.next_pool(), Some(pool(1)));
        assert_eq!(partitions.full().len(), 1);
        assert_eq!(partitions.available().len(), 2);
    }

    #[test]
    fn free_unknown_pool_is_rejected() {
        let mut partitions = ImagePoolPartitions::new(4);
        partitions.push_pool(pool(1));
        let err = partitions.record_free(pool(9)).unwrap_err();
        assert!(matches!(err, GpuError::ResourceNotFound(_)));
    }

    #[test]
    fn over_free_is_rejected() {
        let mut partitions = ImagePoolPartitions::new(4);
        partitions.push_pool(pool(1));
        let err = partitions.record_free(pool(1)).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert_eq!(partitions.remaining(pool(1)), Some(4));
    }

    #[test]
    fn capacity_is_conserved_under_churn() {
        let capacity = 3;
        let mut partitions = ImagePoolPartitions::new(capacity);
        let mut next_raw = 1u64;
        // (pool raw handle, allocated count)
        let mut outstanding: Vec<(u64, u32)> = Vec::new();
        let mut live: Vec<u64> = Vec::new();
        let mut seed = 0x2545_f491_u64;

        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let allocate = live.is_empty() || seed % 3 != 0;

            if allocate {
                if partitions.next_pool().is_none() {
                    partitions.push_pool(pool(next_raw));
                    next_raw += 1;
                }
                let raw = partitions.record_allocation().unwrap().as_raw();
                live.push(raw);
                match outstanding.iter_mut().find(|(p, _)| *p == raw) {
                    Some((_, n)) => *n += 1,
                    None => outstanding.push((raw, 1)),
                }
            } else {
                let raw = live.swap_remove((seed as usize / 3) % live.len());
                partitions.record_free(pool(raw)).unwrap();
                if let Some((_, n)) = outstanding.iter_mut().find(|(p, _)| *p == raw) {
                    *n -= 1;
                }
            }

            assert_conserved(&partitions, &outstanding);
            assert_eq!(partitions.outstanding() as usize, live.len());
        }
    }
}
