use ash::vk;
use std::fmt;

use crate::core::MAX_FRAMES_IN_FLIGHT;
use crate::render::backend::allocation::BufferCache;
use crate::render::context::Context;
use crate::render::error::{RenderError, RenderResult};
use crate::render::geometry::{Geometry, Topology};
use crate::render::rotator::Rotator;

/// Buffer pairs one geometry rotates through across frames
const GEOMETRY_SLOTS: usize = MAX_FRAMES_IN_FLIGHT + 1;

struct GeometrySlot {
    vertices: BufferCache,
    indices: BufferCache,
    /// Frame the slot was last written in
    written_at: Option<u64>,
    /// Frame a later write moved past this slot
    retired_at: Option<u64>,
}

impl GeometrySlot {
    fn new(context: &Context) -> Self {
        Self {
            vertices: BufferCache::new(context),
            indices: BufferCache::new(context),
            written_at: None,
            retired_at: None,
        }
    }

    /// Whether no frame still in flight can read the slot at `frame`
    fn reusable(&self, frame: u64, delay: u32) -> bool {
        self.retired_at.map_or(true, |retired| frame >= retired + u64::from(delay))
    }

    fn release(&mut self) {
        self.vertices.release();
        self.indices.release();
    }
}

/// Vertex and index buffers for one piece of geometry
///
/// Buffers a previous frame may have bound are never written. The first
/// write in a new frame moves to the next slot of a small ring; a slot is
/// written again only once the deferred delay has passed since it was
/// retired, otherwise its buffers go to the deferred queue and fresh ones
/// are made. Writes within one frame reuse the current slot in place, so
/// draws recorded earlier in that frame read the last payload written
/// before submission. A CPU copy of the last payload is kept for
/// inspection.
pub struct GeometryBuffer {
    context: Context,
    name: String,
    slots: Rotator<GeometrySlot, GEOMETRY_SLOTS>,
    geometry: Geometry,
}

impl GeometryBuffer {
    /// Empty buffer
    pub fn new(context: &Context, name: impl Into<String>) -> Self {
        Self {
            context: context.clone(),
            name: name.into(),
            slots: (0..GEOMETRY_SLOTS).map(|_| GeometrySlot::new(context)).collect(),
            geometry: Geometry::default(),
        }
    }

    /// Buffer holding `geometry`
    pub fn from_geometry(context: &Context, name: impl Into<String>, geometry: &Geometry) -> RenderResult<Self> {
        if !context.is_active() {
            return Err(RenderError::InactiveInstance);
        }
        let mut buffer = Self::new(context, name);
        buffer.write(geometry)?;
        Ok(buffer)
    }

    /// Upload `geometry`
    ///
    /// Fails with `InvalidArgument` when there are no vertices or an index
    /// is out of range. Does nothing on an inactive context.
    pub fn write(&mut self, geometry: &Geometry) -> RenderResult<()> {
        validate(geometry)?;
        if !self.context.is_active() {
            return Ok(());
        }

        let slot = self.writable_slot();
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&geometry.vertices);
        if slot
            .vertices
            .refresh(vertex_bytes.len() as u64, vk::BufferUsageFlags::VERTEX_BUFFER)
            .is_none()
            || !slot.vertices.write(vertex_bytes)
        {
            return Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }

        if geometry.is_indexed() {
            let index_bytes: &[u8] = bytemuck::cast_slice(&geometry.indices);
            if slot
                .indices
                .refresh(index_bytes.len() as u64, vk::BufferUsageFlags::INDEX_BUFFER)
                .is_none()
                || !slot.indices.write(index_bytes)
            {
                return Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
        }

        self.geometry.clone_from(geometry);
        log::trace!(
            "Geometry '{}' now {} vertices, {} indices in slot {}",
            self.name,
            geometry.vertices.len(),
            geometry.indices.len(),
            self.slots.index()
        );
        Ok(())
    }

    /// Slot this frame's write lands in, rotating on the first write of a frame
    fn writable_slot(&mut self) -> &mut GeometrySlot {
        let frame = self.context.frame_index();
        let delay = self.context.deferred_delay();

        let current = self.slots.get_mut();
        if current.written_at.is_some_and(|written| written != frame) {
            current.retired_at = Some(frame);
            let next = self.slots.next();
            if !next.reusable(frame, delay) {
                next.release();
            }
        }

        let slot = self.slots.get_mut();
        slot.written_at = Some(frame);
        slot.retired_at = None;
        slot
    }

    /// Last uploaded payload
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether there is drawable data on a live device
    pub fn is_valid(&self) -> bool {
        self.context.is_active() && self.slots.get().vertices.get().is_some() && !self.geometry.vertices.is_empty()
    }

    /// Vertex buffer handle, null when empty
    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.slots.get().vertices.handle()
    }

    /// Index buffer handle, null when not indexed
    pub fn index_buffer(&self) -> vk::Buffer {
        if self.geometry.is_indexed() {
            self.slots.get().indices.handle()
        } else {
            vk::Buffer::null()
        }
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> u32 {
        self.geometry.vertices.len() as u32
    }

    /// Number of indices, zero when not indexed
    pub fn index_count(&self) -> u32 {
        self.geometry.indices.len() as u32
    }

    /// Primitive topology of the payload
    pub fn topology(&self) -> Topology {
        self.geometry.topology
    }
}

impl fmt::Debug for GeometryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeometryBuffer")
            .field("name", &self.name)
            .field("vertices", &self.geometry.vertices.len())
            .field("indices", &self.geometry.indices.len())
            .finish()
    }
}

fn validate(geometry: &Geometry) -> RenderResult<()> {
    if geometry.vertices.is_empty() {
        return Err(RenderError::invalid("geometry has no vertices"));
    }
    let count = geometry.vertices.len();
    if let Some(&index) = geometry.indices.iter().find(|&&index| index as usize >= count) {
        return Err(RenderError::invalid(format!(
            "index {index} out of range for {count} vertices"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::geometry::Vertex;

    fn triangle_fan(count: u32) -> Geometry {
        let vertices = (0..count).map(|i| Vertex::new([i as f32, 0.0], [0.0, 0.0])).collect();
        let indices = (1..count.saturating_sub(1)).flat_map(|i| [0, i, i + 1]).collect();
        Geometry::new(vertices, indices)
    }

    #[test]
    fn test_rewrite_reuses_buffers() {
        let context = Context::headless();
        let mut buffer = GeometryBuffer::new(&context, "fan");
        buffer.write(&triangle_fan(3)).unwrap();
        let allocated = context.stats().buffers_allocated;
        let handle = buffer.vertex_buffer();

        let larger = triangle_fan(6);
        buffer.write(&larger).unwrap();
        assert_eq!(context.stats().buffers_allocated, allocated);
        assert_eq!(buffer.vertex_buffer(), handle);
        assert_eq!(buffer.geometry(), &larger);
        assert_eq!(buffer.vertex_count(), 6);
    }

    #[test]
    fn test_growth_defers_old_buffer() {
        let context = Context::headless();
        let mut buffer = GeometryBuffer::new(&context, "grow");
        buffer.write(&triangle_fan(3)).unwrap();
        buffer.write(&triangle_fan(100)).unwrap();
        assert!(context.pending_releases() >= 1);
        assert_eq!(buffer.index_count(), 98 * 3);
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        let context = Context::headless();
        let mut buffer = GeometryBuffer::new(&context, "bad");
        assert!(matches!(buffer.write(&Geometry::default()), Err(RenderError::InvalidArgument(_))));

        let mut geometry = triangle_fan(3);
        geometry.indices.push(3);
        assert!(matches!(buffer.write(&geometry), Err(RenderError::InvalidArgument(_))));
        assert!(!buffer.is_valid());
    }

    #[test]
    fn test_non_indexed_has_no_index_buffer() {
        let context = Context::headless();
        let geometry = Geometry::new(vec![Vertex::new([0.0, 0.0], [0.0, 0.0]); 3], Vec::new());
        let buffer = GeometryBuffer::from_geometry(&context, "plain", &geometry).unwrap();
        assert!(buffer.is_valid());
        assert_eq!(buffer.index_buffer(), vk::Buffer::null());
        assert_eq!(context.stats().buffers_allocated, 1);
    }

    #[test]
    fn test_inactive_context_is_falsy() {
        let mut buffer = GeometryBuffer::new(&Context::inactive(), "idle");
        assert!(buffer.write(&triangle_fan(3)).is_ok());
        assert!(!buffer.is_valid());
        assert!(matches!(
            GeometryBuffer::from_geometry(&Context::inactive(), "idle", &triangle_fan(3)),
            Err(RenderError::InactiveInstance)
        ));
    }

    #[test]
    fn test_rewrite_in_later_frame_leaves_bound_bytes_alone() {
        let context = Context::headless();
        let mut buffer = GeometryBuffer::from_geometry(&context, "moving", &triangle_fan(4)).unwrap();
        let bound = buffer.vertex_buffer();
        let before = buffer.slots.get().vertices.get().unwrap().mapped().unwrap().to_vec();

        context.end_frame();
        let mut moved = triangle_fan(4);
        moved.vertices[0].position = [9.0, 9.0];
        buffer.write(&moved).unwrap();

        assert_ne!(buffer.vertex_buffer(), bound);
        let old = buffer
            .slots
            .iter()
            .find(|slot| slot.vertices.handle() == bound)
            .unwrap();
        assert_eq!(old.vertices.get().unwrap().mapped().unwrap(), &before[..]);
        assert_eq!(buffer.geometry(), &moved);
    }

    #[test]
    fn test_slots_recycle_after_delay() {
        let context = Context::headless();
        let mut buffer = GeometryBuffer::new(&context, "ticking");
        for _ in 0..20 {
            buffer.write(&triangle_fan(5)).unwrap();
            context.end_frame();
        }
        assert_eq!(context.stats().buffers_allocated, 2 * GEOMETRY_SLOTS as u64);
        assert_eq!(context.pending_releases(), 0);
    }

    #[test]
    fn test_slot_still_in_flight_is_not_reused() {
        let mut slot = GeometrySlot::new(&Context::headless());
        assert!(slot.reusable(0, 3));
        slot.retired_at = Some(4);
        assert!(!slot.reusable(6, 3));
        assert!(slot.reusable(7, 3));
    }
}
