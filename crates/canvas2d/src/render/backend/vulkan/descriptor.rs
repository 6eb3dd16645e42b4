//! Descriptor set layouts and rotating per-frame set allocation
//!
//! Every set number the pipelines use (scene, instances, material) gets its
//! own [`DescriptorAllocator`]. An allocator keeps one arena per buffered
//! frame. Within a frame, [`DescriptorAllocator::post_increment`] hands out
//! the next unused set, creating a new pool block when the arena runs dry.
//! [`DescriptorAllocator::next`] moves to the following frame's arena and
//! rewinds it, so sets are reused once that frame's fence has signalled.
//!
//! Each set owns a host-visible buffer per buffer binding. Buffers grow when
//! a larger write arrives and never shrink.

use ash::{vk, Device};

use crate::core::MAX_FRAMES_IN_FLIGHT;
use crate::render::backend::allocation::BufferCache;
use crate::render::context::Context;
use crate::render::error::{RenderError, RenderResult};
use crate::render::rotator::Rotator;

/// Builder for descriptor set layouts
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self { bindings: Vec::new() }
    }

    fn add(mut self, binding: u32, ty: vk::DescriptorType, stage_flags: vk::ShaderStageFlags) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(stage_flags)
                .build(),
        );
        self
    }

    /// Add a uniform buffer binding
    pub fn add_uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags)
    }

    /// Add a storage buffer binding
    pub fn add_storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::STORAGE_BUFFER, stage_flags)
    }

    /// Add a combined image sampler binding
    pub fn add_combined_image_sampler(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stage_flags)
    }

    /// Create the layout
    pub fn build(self, device: &Device) -> RenderResult<DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);
        let layout =
            unsafe { device.create_descriptor_set_layout(&layout_info, None) }.map_err(RenderError::Vulkan)?;

        Ok(DescriptorSetLayout {
            layout,
            device: device.clone(),
            bindings: self.bindings,
        })
    }
}

impl Default for DescriptorSetLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor set layout with RAII cleanup
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Device,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    /// Native handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Bindings the layout was built from
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Pool sizes for `sets` sets of a layout with `bindings`
pub fn pool_sizes(bindings: &[vk::DescriptorSetLayoutBinding], sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let count = binding.descriptor_count * sets;
        match sizes.iter_mut().find(|size| size.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

/// Bump allocator over slots that are created a block at a time
///
/// `reset` rewinds without freeing, so blocks created in earlier frames are
/// reused.
#[derive(Debug)]
pub struct SetArena<S> {
    slots: Vec<S>,
    block_size: usize,
    blocks: usize,
    index: usize,
}

impl<S> SetArena<S> {
    /// Empty arena growing by `block_size` slots
    pub fn new(block_size: usize) -> Self {
        Self {
            slots: Vec::new(),
            block_size: block_size.max(1),
            blocks: 0,
            index: 0,
        }
    }

    /// Return the current slot and advance
    ///
    /// When every slot is in use, `grow` is asked for another block. It
    /// returns an empty vector on failure, and then so does this.
    pub fn post_increment<F>(&mut self, grow: F) -> Option<&mut S>
    where
        F: FnOnce(usize) -> Vec<S>,
    {
        if self.index >= self.slots.len() {
            let block = grow(self.block_size);
            if block.is_empty() {
                return None;
            }
            self.slots.extend(block);
            self.blocks += 1;
        }
        let index = self.index;
        self.index += 1;
        self.slots.get_mut(index)
    }

    /// Rewind to the first slot
    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// Slots handed out since the last reset
    pub fn in_use(&self) -> usize {
        self.index
    }

    /// Slots created so far
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Blocks created so far
    pub fn blocks(&self) -> usize {
        self.blocks
    }
}

/// One descriptor set and the buffers behind its buffer bindings
pub struct SetSlot {
    set: vk::DescriptorSet,
    buffers: Vec<Option<BufferCache>>,
}

struct FrameArena {
    pools: Vec<vk::DescriptorPool>,
    arena: SetArena<SetSlot>,
}

/// Rotating descriptor set allocator for one set number
pub struct DescriptorAllocator {
    device: Device,
    context: Context,
    layout: DescriptorSetLayout,
    frames: Rotator<FrameArena, MAX_FRAMES_IN_FLIGHT>,
    block_size: u32,
}

impl DescriptorAllocator {
    /// Allocator for `layout` with `frames_in_flight` arenas of `block_size`-set blocks
    pub fn new(
        device: &Device,
        context: &Context,
        layout: DescriptorSetLayout,
        frames_in_flight: usize,
        block_size: u32,
    ) -> RenderResult<Self> {
        if frames_in_flight == 0 || frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(RenderError::invalid(format!(
                "frames in flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {frames_in_flight}"
            )));
        }
        if block_size == 0 {
            return Err(RenderError::invalid("descriptor block size must be non-zero"));
        }

        let frames = (0..frames_in_flight)
            .map(|_| FrameArena {
                pools: Vec::new(),
                arena: SetArena::new(block_size as usize),
            })
            .collect();

        Ok(Self {
            device: device.clone(),
            context: context.clone(),
            layout,
            frames,
            block_size,
        })
    }

    /// Layout every set is allocated with
    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    /// Hand out the current frame's next set
    ///
    /// Returns `None` if a new block was needed and could not be created.
    pub fn post_increment(&mut self) -> Option<SetWriter<'_>> {
        let Self {
            device,
            context,
            layout,
            frames,
            block_size,
        } = self;
        let FrameArena { pools, arena } = frames.get_mut();

        let slot = arena.post_increment(|count| match create_block(device, context, layout, count, *block_size) {
            Ok((pool, slots)) => {
                pools.push(pool);
                slots
            }
            Err(e) => {
                log::error!("Descriptor block allocation failed: {}", e);
                Vec::new()
            }
        })?;

        Some(SetWriter {
            device,
            bindings: layout.bindings(),
            slot,
        })
    }

    /// Rotate to the next frame's arena and rewind it
    pub fn next(&mut self) {
        self.frames.next().arena.reset();
    }

    /// Sets handed out in the current frame
    pub fn in_use(&self) -> usize {
        self.frames.get().arena.in_use()
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        for frame in self.frames.iter_mut() {
            for pool in frame.pools.drain(..) {
                unsafe { self.device.destroy_descriptor_pool(pool, None) };
            }
        }
    }
}

fn create_block(
    device: &Device,
    context: &Context,
    layout: &DescriptorSetLayout,
    count: usize,
    block_size: u32,
) -> RenderResult<(vk::DescriptorPool, Vec<SetSlot>)> {
    let sizes = pool_sizes(layout.bindings(), block_size);
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .max_sets(block_size)
        .pool_sizes(&sizes);
    let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(RenderError::Vulkan)?;

    let layouts = vec![layout.handle(); count.min(block_size as usize)];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let sets = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
        Ok(sets) => sets,
        Err(e) => {
            unsafe { device.destroy_descriptor_pool(pool, None) };
            return Err(RenderError::Vulkan(e));
        }
    };

    log::trace!("Created descriptor block of {} sets", sets.len());
    let slots = sets
        .into_iter()
        .map(|set| SetSlot {
            set,
            buffers: layout
                .bindings()
                .iter()
                .map(|binding| buffer_usage(binding.descriptor_type).map(|_| BufferCache::new(context)))
                .collect(),
        })
        .collect();
    Ok((pool, slots))
}

fn buffer_usage(ty: vk::DescriptorType) -> Option<vk::BufferUsageFlags> {
    match ty {
        vk::DescriptorType::UNIFORM_BUFFER => Some(vk::BufferUsageFlags::UNIFORM_BUFFER),
        vk::DescriptorType::STORAGE_BUFFER => Some(vk::BufferUsageFlags::STORAGE_BUFFER),
        _ => None,
    }
}

/// Position, type and buffer usage of a buffer-backed `binding`
fn buffer_binding(
    bindings: &[vk::DescriptorSetLayoutBinding],
    binding: u32,
) -> Option<(usize, vk::DescriptorType, vk::BufferUsageFlags)> {
    let position = bindings.iter().position(|b| b.binding == binding)?;
    let ty = bindings[position].descriptor_type;
    buffer_usage(ty).map(|usage| (position, ty, usage))
}

/// Copy `bytes` into `cache`, replacing its buffer only when it is too small
fn stage_bytes(cache: &mut BufferCache, bytes: &[u8], usage: vk::BufferUsageFlags) -> Option<vk::Buffer> {
    cache.refresh(bytes.len() as u64, usage)?;
    cache.write(bytes).then(|| cache.handle())
}

/// Writes data and images into one descriptor set
pub struct SetWriter<'a> {
    device: &'a Device,
    bindings: &'a [vk::DescriptorSetLayoutBinding],
    slot: &'a mut SetSlot,
}

impl SetWriter<'_> {
    /// The set being written
    pub fn set(&self) -> vk::DescriptorSet {
        self.slot.set
    }

    /// Copy `bytes` into the buffer behind `binding` and point the descriptor at it
    ///
    /// The descriptor type (uniform or storage) follows the layout. Returns
    /// false for an unknown or non-buffer binding, empty `bytes`, or a failed
    /// allocation.
    pub fn write(&mut self, binding: u32, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return false;
        }
        let Some((position, ty, usage)) = buffer_binding(self.bindings, binding) else {
            log::warn!("Descriptor write to binding {} which holds no buffer", binding);
            return false;
        };
        let Some(Some(cache)) = self.slot.buffers.get_mut(position) else {
            return false;
        };
        let Some(buffer) = stage_bytes(cache, bytes, usage) else {
            return false;
        };

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range: bytes.len() as u64,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.slot.set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(&buffer_info)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        true
    }

    /// Point a combined image sampler binding at `view`
    ///
    /// Returns false if either handle is null.
    pub fn update(&mut self, binding: u32, sampler: vk::Sampler, view: vk::ImageView) -> bool {
        if sampler == vk::Sampler::null() || view == vk::ImageView::null() {
            return false;
        }
        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.slot.set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Vec<vk::DescriptorSetLayoutBinding> {
        DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT)
            .add_combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT)
            .add_storage_buffer(3, vk::ShaderStageFlags::VERTEX)
            .bindings
    }

    #[test]
    fn test_buffer_binding_lookup() {
        let bindings = bindings();
        assert_eq!(
            buffer_binding(&bindings, 0),
            Some((0, vk::DescriptorType::UNIFORM_BUFFER, vk::BufferUsageFlags::UNIFORM_BUFFER))
        );
        assert_eq!(
            buffer_binding(&bindings, 3),
            Some((2, vk::DescriptorType::STORAGE_BUFFER, vk::BufferUsageFlags::STORAGE_BUFFER))
        );
        assert_eq!(buffer_binding(&bindings, 1), None);
        assert_eq!(buffer_binding(&bindings, 2), None);
    }

    #[test]
    fn test_binding_buffer_grows_and_never_shrinks() {
        let context = Context::headless();
        let mut cache = BufferCache::new(&context);
        let usage = vk::BufferUsageFlags::UNIFORM_BUFFER;

        let first = stage_bytes(&mut cache, &[1; 100], usage).unwrap();
        assert_eq!(cache.capacity(), 256);
        assert_eq!(stage_bytes(&mut cache, &[2; 40], usage), Some(first));
        assert_eq!(context.stats().buffers_allocated, 1);

        let grown = stage_bytes(&mut cache, &[3; 1000], usage).unwrap();
        assert_ne!(grown, first);
        assert_eq!(cache.capacity(), 1024);
        assert_eq!(context.pending_releases(), 1);

        assert_eq!(stage_bytes(&mut cache, &[4; 8], usage), Some(grown));
        assert_eq!(cache.capacity(), 1024);
        assert_eq!(&cache.get().unwrap().mapped().unwrap()[..8], &[4; 8]);
    }

    #[test]
    fn test_arena_grows_by_block() {
        let mut arena: SetArena<u32> = SetArena::new(4);
        let mut grown = 0;
        for i in 0..6 {
            let slot = arena.post_increment(|n| {
                grown += 1;
                (0..n as u32).map(|k| k + 100 * grown).collect()
            });
            assert!(slot.is_some(), "slot {i}");
        }
        assert_eq!(arena.blocks(), 2);
        assert_eq!(arena.capacity(), 8);
        assert_eq!(arena.in_use(), 6);
    }

    #[test]
    fn test_arena_reset_reuses_slots() {
        let mut arena: SetArena<u32> = SetArena::new(2);
        let first = *arena.post_increment(|n| (0..n as u32).collect()).unwrap();
        arena.post_increment(|_| unreachable!());

        arena.reset();
        let again = *arena.post_increment(|_| panic!("must not grow")).unwrap();
        assert_eq!(first, again);
        assert_eq!(arena.blocks(), 1);
    }

    #[test]
    fn test_arena_failed_growth() {
        let mut arena: SetArena<u32> = SetArena::new(2);
        assert!(arena.post_increment(|_| Vec::new()).is_none());
        assert_eq!(arena.in_use(), 0);
        assert!(arena.post_increment(|n| vec![7; n]).is_some());
    }

    #[test]
    fn test_pool_sizes_merge_types() {
        let bindings = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT)
            .add_combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT)
            .add_uniform_buffer(2, vk::ShaderStageFlags::VERTEX)
            .bindings;
        let sizes = pool_sizes(&bindings, 64);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 128);
        assert_eq!(sizes[1].descriptor_count, 64);
    }
}
