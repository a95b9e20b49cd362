// r_dynamic.rs — streaming VBOs for transient geometry
// Sprites, polys and 2D pics are appended to one of two streams and merged into
// as few draws as possible; the pending sub-range is uploaded on flush.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use fusion_common::q_shared::Vec4;

use crate::r_backend::{Primitive, RBackend, VboId};
use crate::r_mesh::{build_trifan_elements, copy_offset_elements, copy_offset_triangles};
use crate::r_public::{Entity, RenderFx};
use crate::r_shader::{Shader, ShaderFlags, VertexAttribs};

pub const MAX_STREAM_VBO_VERTS: usize = 8192;
pub const MAX_STREAM_VBO_ELEMENTS: usize = MAX_STREAM_VBO_VERTS * 6;
pub const MAX_DYNAMIC_DRAWS: usize = 2048;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Every vertex attribute.
    Full = 0,
    /// Position, color and texture coordinates only.
    Compact = 1,
}

/// Vertex layout of the full stream.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct StreamVertex {
    pub xyz: [f32; 4],
    pub normal: [f32; 4],
    pub st: [f32; 2],
    pub color: [u8; 4],
}

impl StreamVertex {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Vertex layout of the compact stream.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CompactVertex {
    pub xyz: [f32; 4],
    pub color: [u8; 4],
    pub st: [f32; 2],
}

impl CompactVertex {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Borrowed geometry handed to `add_dynamic_mesh`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DynamicMesh<'a> {
    pub xyz: &'a [Vec4],
    pub normals: Option<&'a [Vec4]>,
    pub st: Option<&'a [[f32; 2]]>,
    pub colors: Option<&'a [[u8; 4]]>,
    /// Empty means a triangle fan over `xyz`.
    pub elems: &'a [u16],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawElements {
    pub first_vert: usize,
    pub num_verts: usize,
    pub first_elem: usize,
    pub num_elems: usize,
}

#[derive(Debug)]
pub(crate) struct DynamicStream {
    kind: StreamKind,
    vertex_size: usize,
    /// Pending range not yet uploaded.
    pending: DrawElements,
    vertex_data: Vec<u8>,
    elems: Vec<u16>,
}

impl DynamicStream {
    fn new(kind: StreamKind) -> Self {
        let vertex_size = match kind {
            StreamKind::Full => StreamVertex::SIZE,
            StreamKind::Compact => CompactVertex::SIZE,
        };
        Self {
            kind,
            vertex_size,
            pending: DrawElements::default(),
            vertex_data: Vec::with_capacity(MAX_STREAM_VBO_VERTS * vertex_size),
            elems: Vec::with_capacity(MAX_STREAM_VBO_ELEMENTS),
        }
    }

    fn reset(&mut self) {
        self.pending = DrawElements::default();
        self.vertex_data.clear();
        self.elems.clear();
    }

    fn write_vertices(&mut self, dest_vert: usize, mesh: &DynamicMesh) {
        self.vertex_data.truncate(dest_vert * self.vertex_size);
        for (i, xyz) in mesh.xyz.iter().enumerate() {
            let st = mesh.st.and_then(|st| st.get(i)).copied().unwrap_or_default();
            let color = mesh.colors.and_then(|c| c.get(i)).copied().unwrap_or([255; 4]);
            match self.kind {
                StreamKind::Full => {
                    let normal = mesh.normals.and_then(|n| n.get(i)).copied().unwrap_or_default();
                    let v = StreamVertex { xyz: *xyz, normal, st, color };
                    self.vertex_data.extend_from_slice(bytemuck::bytes_of(&v));
                }
                StreamKind::Compact => {
                    let v = CompactVertex { xyz: *xyz, color, st };
                    self.vertex_data.extend_from_slice(bytemuck::bytes_of(&v));
                }
            }
        }
    }
}

/// One queued draw out of a stream.
#[derive(Clone, Debug)]
pub(crate) struct DynamicDraw {
    entity_num: Option<usize>,
    entity: Option<Entity>,
    renderfx: RenderFx,
    shader: Arc<Shader>,
    stream: StreamKind,
    primitive: Primitive,
    scissor: [i32; 4],
    range: DrawElements,
}

#[derive(Debug)]
pub(crate) struct DynamicStreams {
    streams: [DynamicStream; 2],
    draws: Vec<DynamicDraw>,
}

impl DynamicStreams {
    pub(crate) fn new() -> Self {
        Self {
            streams: [DynamicStream::new(StreamKind::Full), DynamicStream::new(StreamKind::Compact)],
            draws: Vec::with_capacity(MAX_DYNAMIC_DRAWS),
        }
    }

    /// Rewinds both streams; called at frame start.
    pub(crate) fn reset_cursors(&mut self) {
        for stream in &mut self.streams {
            stream.reset();
        }
    }

    pub(crate) fn num_draws(&self) -> usize {
        self.draws.len()
    }
}

impl RBackend {
    /// Queues transient geometry. Returns false if the mesh was rejected.
    pub fn add_dynamic_mesh(
        &mut self,
        entity: Option<(usize, &Entity)>,
        shader: &Arc<Shader>,
        mesh: &DynamicMesh,
        primitive: Primitive,
    ) -> bool {
        let num_verts = mesh.xyz.len();
        let trifan = mesh.elems.is_empty();
        let num_elems = if trifan {
            (num_verts.max(2) - 2) * 3
        } else {
            mesh.elems.len()
        };

        if num_verts == 0
            || num_elems == 0
            || num_verts > MAX_STREAM_VBO_VERTS
            || num_elems > MAX_STREAM_VBO_ELEMENTS
        {
            return false;
        }

        let entity_num = entity.map(|(num, _)| num);
        let renderfx = entity.map_or(RenderFx::empty(), |(_, e)| e.renderfx);
        let scissor = self.get_scissor();

        let mut merge = false;
        let mut stream_kind = None;
        if let Some(prev) = self.streams.draws.last() {
            let same_entity = shader.flags.contains(ShaderFlags::ENTITY_MERGABLE)
                || prev.entity_num == entity_num;
            if same_entity && prev.renderfx == renderfx && prev.shader.id == shader.id {
                stream_kind = Some(prev.stream);
                merge = prev.primitive == primitive && prev.scissor == scissor;
            }
        }
        let stream_kind = stream_kind.unwrap_or_else(|| {
            if shader.vattribs.intersects(!VertexAttribs::COMPACT) {
                StreamKind::Full
            } else {
                StreamKind::Compact
            }
        });

        let overflow = {
            let pending = &self.streams.streams[stream_kind as usize].pending;
            (!merge && self.streams.draws.len() + 1 > MAX_DYNAMIC_DRAWS)
                || pending.first_vert + pending.num_verts + num_verts > MAX_STREAM_VBO_VERTS
                || pending.first_elem + pending.num_elems + num_elems > MAX_STREAM_VBO_ELEMENTS
        };
        if overflow {
            self.flush_dynamic_meshes();
            self.streams.streams[stream_kind as usize].reset();
            merge = false;
        }

        let stream = &mut self.streams.streams[stream_kind as usize];
        let dest_vert = stream.pending.first_vert + stream.pending.num_verts;
        let dest_elem = stream.pending.first_elem + stream.pending.num_elems;

        if merge {
            if let Some(prev) = self.streams.draws.last_mut() {
                prev.range.num_verts += num_verts;
                prev.range.num_elems += num_elems;
            }
        } else {
            self.streams.draws.push(DynamicDraw {
                entity_num,
                entity: entity.map(|(_, e)| e.clone()),
                renderfx,
                shader: shader.clone(),
                stream: stream_kind,
                primitive,
                scissor,
                range: DrawElements {
                    first_vert: dest_vert,
                    num_verts,
                    first_elem: dest_elem,
                    num_elems,
                },
            });
        }

        stream.write_vertices(dest_vert, mesh);
        stream.elems.truncate(dest_elem);
        let offset = dest_vert as u16;
        if trifan {
            build_trifan_elements(offset, num_verts, &mut stream.elems);
        } else if primitive == Primitive::Triangles {
            copy_offset_triangles(mesh.elems, offset, &mut stream.elems);
        } else {
            copy_offset_elements(mesh.elems, offset, &mut stream.elems);
        }

        // triangle copies drop a trailing partial triangle
        let written = stream.elems.len() - dest_elem;
        if written != num_elems {
            if merge {
                if let Some(prev) = self.streams.draws.last_mut() {
                    prev.range.num_elems -= num_elems - written;
                }
            } else if let Some(draw) = self.streams.draws.last_mut() {
                draw.range.num_elems = written;
            }
        }

        stream.pending.num_verts += num_verts;
        stream.pending.num_elems += written;
        true
    }

    /// Uploads the pending stream ranges and issues every queued draw.
    pub fn flush_dynamic_meshes(&mut self) {
        if self.streams.draws.is_empty() {
            return;
        }

        for i in 0..self.streams.streams.len() {
            let kind = self.streams.streams[i].kind;
            self.bind_vbo(VboId::Stream(kind), Primitive::Triangles);

            let stream = &mut self.streams.streams[i];
            let pending = stream.pending;
            if pending.num_elems > 0 {
                let elems = stream.elems[pending.first_elem..pending.first_elem + pending.num_elems].to_vec();
                stream.pending.first_elem += pending.num_elems;
                stream.pending.num_elems = 0;
                self.gpu_mut().upload_stream_elems(kind, pending.first_elem, &elems);
            }

            let stream = &mut self.streams.streams[i];
            if pending.num_verts > 0 {
                let size = stream.vertex_size;
                let data = stream.vertex_data
                    [pending.first_vert * size..(pending.first_vert + pending.num_verts) * size]
                    .to_vec();
                stream.pending.first_vert += pending.num_verts;
                stream.pending.num_verts = 0;
                self.gpu_mut().upload_stream_verts(kind, pending.first_vert, &data);
            }
        }

        let [sx, sy, sw, sh] = self.get_scissor();
        let object = *self.object_matrix();
        self.load_object_matrix(&object);

        let draws = std::mem::take(&mut self.streams.draws);
        for draw in &draws {
            self.bind_shader(draw.entity.as_ref(), &draw.shader);
            self.bind_vbo(VboId::Stream(draw.stream), draw.primitive);
            let [x, y, w, h] = draw.scissor;
            self.scissor(x, y, w, h);
            self.draw_elements(
                draw.range.first_vert as u32,
                draw.range.num_verts as u32,
                draw.range.first_elem as u32,
                draw.range.num_elems as u32,
            );
        }
        self.streams.draws = draws;
        self.streams.draws.clear();

        self.scissor(sx, sy, sw, sh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r_backend::testing::{GpuCall, TraceBackend};
    use crate::r_shader::{ShaderDesc, ShaderRegistry, ShaderSort};

    fn sprite_shader(reg: &mut ShaderRegistry, name: &str, flags: ShaderFlags) -> Arc<Shader> {
        reg.register(name, ShaderDesc {
            flags,
            sort: ShaderSort::Additive,
            vattribs: VertexAttribs::COMPACT,
            ..Default::default()
        })
    }

    fn triangle(base: f32) -> [Vec4; 3] {
        [[base, 0.0, 0.0, 1.0], [base, 1.0, 0.0, 1.0], [base, 0.0, 1.0, 1.0]]
    }

    fn uploaded_positions(trace: &crate::r_backend::testing::Trace) -> Vec<f32> {
        let mut out = Vec::new();
        for call in trace.calls() {
            if let GpuCall::UploadVerts { stream: StreamKind::Compact, data, .. } = call {
                out.extend(
                    data.chunks_exact(CompactVertex::SIZE)
                        .map(|c| bytemuck::pod_read_unaligned::<CompactVertex>(c).xyz[0]),
                );
            }
        }
        out
    }

    #[test]
    fn test_vertex_layouts_are_packed() {
        assert_eq!(StreamVertex::SIZE, 44);
        assert_eq!(CompactVertex::SIZE, 28);
    }

    #[test]
    fn test_merge_same_shader_into_one_draw() {
        let (mut rb, trace) = TraceBackend::rbackend();
        let mut reg = ShaderRegistry::new().unwrap();
        let shader = sprite_shader(&mut reg, "sprite", ShaderFlags::empty());

        for i in 0..10 {
            let tri = triangle(i as f32);
            assert!(rb.add_dynamic_mesh(None, &shader, &DynamicMesh { xyz: &tri, ..Default::default() }, Primitive::Triangles));
        }
        rb.flush_dynamic_meshes();
        assert_eq!(
            trace.count(|c| matches!(c, GpuCall::Draw { .. })),
            1
        );
        assert!(trace.calls().contains(&GpuCall::Draw {
            first_vert: 0,
            num_verts: 30,
            first_elem: 0,
            num_elems: 30
        }));
    }

    #[test]
    fn test_shader_change_starts_new_draw() {
        let (mut rb, trace) = TraceBackend::rbackend();
        let mut reg = ShaderRegistry::new().unwrap();
        let a = sprite_shader(&mut reg, "a", ShaderFlags::empty());
        let b = sprite_shader(&mut reg, "b", ShaderFlags::empty());
        let tri = triangle(0.0);
        let mesh = DynamicMesh { xyz: &tri, ..Default::default() };

        rb.add_dynamic_mesh(None, &a, &mesh, Primitive::Triangles);
        rb.add_dynamic_mesh(None, &b, &mesh, Primitive::Triangles);
        rb.add_dynamic_mesh(None, &b, &mesh, Primitive::Triangles);
        rb.flush_dynamic_meshes();
        assert_eq!(trace.draw_count(), 2);
        assert!(trace.calls().contains(&GpuCall::Draw {
            first_vert: 3,
            num_verts: 6,
            first_elem: 3,
            num_elems: 6
        }));
    }

    #[test]
    fn test_entity_change_breaks_merge_unless_mergable() {
        let (mut rb, trace) = TraceBackend::rbackend();
        let mut reg = ShaderRegistry::new().unwrap();
        let plain = sprite_shader(&mut reg, "plain", ShaderFlags::empty());
        let mergable = sprite_shader(&mut reg, "mergable", ShaderFlags::ENTITY_MERGABLE);
        let e1 = Entity::default();
        let e2 = Entity::default();
        let tri = triangle(0.0);
        let mesh = DynamicMesh { xyz: &tri, ..Default::default() };

        rb.add_dynamic_mesh(Some((5, &e1)), &plain, &mesh, Primitive::Triangles);
        rb.add_dynamic_mesh(Some((6, &e2)), &plain, &mesh, Primitive::Triangles);
        rb.flush_dynamic_meshes();
        assert_eq!(trace.draw_count(), 2);

        trace.clear();
        rb.add_dynamic_mesh(Some((5, &e1)), &mergable, &mesh, Primitive::Triangles);
        rb.add_dynamic_mesh(Some((6, &e2)), &mergable, &mesh, Primitive::Triangles);
        rb.flush_dynamic_meshes();
        assert_eq!(trace.draw_count(), 1);
    }

    #[test]
    fn test_scissor_change_breaks_merge() {
        let (mut rb, trace) = TraceBackend::rbackend();
        let mut reg = ShaderRegistry::new().unwrap();
        let shader = sprite_shader(&mut reg, "s", ShaderFlags::empty());
        let tri = triangle(0.0);
        let mesh = DynamicMesh { xyz: &tri, ..Default::default() };

        rb.scissor(0, 0, 100, 100);
        rb.add_dynamic_mesh(None, &shader, &mesh, Primitive::Triangles);
        rb.scissor(0, 0, 50, 50);
        rb.add_dynamic_mesh(None, &shader, &mesh, Primitive::Triangles);
        rb.flush_dynamic_meshes();
        assert_eq!(trace.draw_count(), 2);
        // scissor restored after the flush
        assert_eq!(rb.get_scissor(), [0, 0, 50, 50]);
    }

    #[test]
    fn test_trifan_elements() {
        let (mut rb, trace) = TraceBackend::rbackend();
        let mut reg = ShaderRegistry::new().unwrap();
        let shader = sprite_shader(&mut reg, "quad", ShaderFlags::empty());
        let quad = [[0.0; 4]; 4];
        rb.add_dynamic_mesh(None, &shader, &DynamicMesh { xyz: &quad, ..Default::default() }, Primitive::Triangles);
        rb.add_dynamic_mesh(None, &shader, &DynamicMesh { xyz: &quad, ..Default::default() }, Primitive::Triangles);
        rb.flush_dynamic_meshes();
        let elems: Vec<u16> = trace
            .calls()
            .into_iter()
            .find_map(|c| match c {
                GpuCall::UploadElems { elems, .. } => Some(elems),
                _ => None,
            })
            .unwrap();
        assert_eq!(elems, vec![0, 1, 2, 0, 2, 3, 4, 5, 6, 4, 6, 7]);
    }

    #[test]
    fn test_rejects_empty_and_oversized() {
        let (mut rb, _trace) = TraceBackend::rbackend();
        let mut reg = ShaderRegistry::new().unwrap();
        let shader = sprite_shader(&mut reg, "s", ShaderFlags::empty());
        assert!(!rb.add_dynamic_mesh(None, &shader, &DynamicMesh::default(), Primitive::Triangles));
        let two = [[0.0; 4]; 2];
        assert!(!rb.add_dynamic_mesh(None, &shader, &DynamicMesh { xyz: &two, ..Default::default() }, Primitive::Triangles));
        let huge = vec![[0.0; 4]; MAX_STREAM_VBO_VERTS + 1];
        assert!(!rb.add_dynamic_mesh(None, &shader, &DynamicMesh { xyz: &huge, ..Default::default() }, Primitive::Triangles));
        assert_eq!(rb.streams.num_draws(), 0);
    }

    #[test]
    fn test_full_stream_chosen_by_vattribs() {
        let (mut rb, trace) = TraceBackend::rbackend();
        let reg = ShaderRegistry::new().unwrap();
        let tri = triangle(0.0);
        rb.add_dynamic_mesh(None, &reg.default_shader, &DynamicMesh { xyz: &tri, ..Default::default() }, Primitive::Triangles);
        rb.flush_dynamic_meshes();
        assert!(trace
            .calls()
            .contains(&GpuCall::BindVbo(VboId::Stream(StreamKind::Full), Primitive::Triangles)));
        assert_eq!(
            trace.count(|c| matches!(c, GpuCall::UploadVerts { stream: StreamKind::Full, .. })),
            1
        );
    }

    #[test]
    fn test_ten_thousand_triangles_draw_count() {
        let (mut rb, trace) = TraceBackend::rbackend();
        let mut reg = ShaderRegistry::new().unwrap();
        let shader = sprite_shader(&mut reg, "particle", ShaderFlags::empty());

        let total = 10_000;
        for i in 0..total {
            let tri = triangle(i as f32);
            rb.add_dynamic_mesh(None, &shader, &DynamicMesh { xyz: &tri, ..Default::default() }, Primitive::Triangles);
        }
        rb.flush_dynamic_meshes();

        let per_batch = MAX_STREAM_VBO_VERTS / 3;
        let expected = (total + per_batch - 1) / per_batch;
        assert_eq!(expected, 4);
        assert_eq!(trace.draw_count(), expected);
        // one upload per flush
        assert_eq!(trace.count(|c| matches!(c, GpuCall::UploadVerts { .. })), expected);

        // uploads concatenate to the submission order
        let xs = uploaded_positions(&trace);
        assert_eq!(xs.len(), total * 3);
        for (i, x) in xs.iter().enumerate() {
            assert_eq!(*x, (i / 3) as f32);
        }
    }

    #[test]
    fn test_draw_limit_forces_flush() {
        let (mut rb, trace) = TraceBackend::rbackend();
        let mut reg = ShaderRegistry::new().unwrap();
        let a = sprite_shader(&mut reg, "a", ShaderFlags::empty());
        let b = sprite_shader(&mut reg, "b", ShaderFlags::empty());
        let tri = triangle(0.0);
        let mesh = DynamicMesh { xyz: &tri, ..Default::default() };

        // alternating shaders never merge; 3 verts each stays under the vertex cap
        for i in 0..MAX_DYNAMIC_DRAWS + 1 {
            let s = if i % 2 == 0 { &a } else { &b };
            rb.add_dynamic_mesh(None, s, &mesh, Primitive::Triangles);
        }
        assert_eq!(trace.draw_count(), MAX_DYNAMIC_DRAWS);
        assert_eq!(rb.streams.num_draws(), 1);
    }
}
