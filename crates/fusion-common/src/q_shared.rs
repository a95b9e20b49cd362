// q_shared.rs — shared math, plane and cvar definitions
// Vector/plane helpers used by the renderer frontend and the portal code.

pub type Vec3 = [f32; 3];
pub type Vec4 = [f32; 4];

/// 3x3 axis matrix stored as rows: forward, right, up.
pub type Mat3 = [Vec3; 3];

pub const AXIS_FORWARD: usize = 0;
pub const AXIS_RIGHT: usize = 1;
pub const AXIS_UP: usize = 2;

pub const VEC3_ORIGIN: Vec3 = [0.0, 0.0, 0.0];
pub const AXIS_IDENTITY: Mat3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

// ============================================================
// Plane
// ============================================================

pub const PLANE_X: u8 = 0;
pub const PLANE_Y: u8 = 1;
pub const PLANE_Z: u8 = 2;
pub const PLANE_NONAXIAL: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct CPlane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8,
    pub signbits: u8,
    pub pad: [u8; 2],
}

impl Default for CPlane {
    fn default() -> Self {
        Self {
            normal: [0.0; 3],
            dist: 0.0,
            plane_type: PLANE_NONAXIAL,
            signbits: 0,
            pad: [0; 2],
        }
    }
}

impl CPlane {
    /// Build a plane from a normal and distance, categorized.
    pub fn new(normal: Vec3, dist: f32) -> Self {
        let mut plane = Self { normal, dist, ..Default::default() };
        categorize_plane(&mut plane);
        plane
    }
}

// ============================================================
// CVar flags
// ============================================================

pub const CVAR_ZERO: i32 = 0;
pub const CVAR_ARCHIVE: i32 = 1;
pub const CVAR_NOSET: i32 = 8;
pub const CVAR_LATCH: i32 = 16;

// ============================================================
// MATHLIB — Vector operations
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn vector_negate(v: &Vec3) -> Vec3 {
    [-v[0], -v[1], -v[2]]
}

/// veca + scale * vecb
#[inline]
pub fn vector_ma(veca: &Vec3, scale: f32, vecb: &Vec3) -> Vec3 {
    [
        veca[0] + scale * vecb[0],
        veca[1] + scale * vecb[1],
        veca[2] + scale * vecb[2],
    ]
}

#[inline]
pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

pub fn cross_product(v1: &Vec3, v2: &Vec3) -> Vec3 {
    [
        v1[1] * v2[2] - v1[2] * v2[1],
        v1[2] * v2[0] - v1[0] * v2[2],
        v1[0] * v2[1] - v1[1] * v2[0],
    ]
}

pub fn vector_compare(v1: &Vec3, v2: &Vec3) -> bool {
    v1[0] == v2[0] && v1[1] == v2[1] && v1[2] == v2[2]
}

pub fn vector_length(v: &Vec3) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

pub fn distance(a: &Vec3, b: &Vec3) -> f32 {
    vector_length(&vector_subtract(a, b))
}

/// Normalize in place, returns original length.
pub fn vector_normalize(v: &mut Vec3) -> f32 {
    let length = vector_length(v);
    if length != 0.0 {
        let ilength = 1.0 / length;
        v[0] *= ilength;
        v[1] *= ilength;
        v[2] *= ilength;
    }
    length
}

/// Mirror `v` across the plane (`normal`, `dist`).
pub fn vector_reflect(v: &Vec3, normal: &Vec3, dist: f32) -> Vec3 {
    let d = -2.0 * (dot_product(v, normal) - dist);
    vector_ma(v, d, normal)
}

pub fn clear_bounds(mins: &mut Vec3, maxs: &mut Vec3) {
    *mins = [99999.0; 3];
    *maxs = [-99999.0; 3];
}

pub fn add_point_to_bounds(v: &Vec3, mins: &mut Vec3, maxs: &mut Vec3) {
    for i in 0..3 {
        if v[i] < mins[i] {
            mins[i] = v[i];
        }
        if v[i] > maxs[i] {
            maxs[i] = v[i];
        }
    }
}

pub fn anglemod(a: f32) -> f32 {
    (360.0 / 65536.0) * (((a * (65536.0 / 360.0)) as i32) & 65535) as f32
}

// ============================================================
// Matrix operations
// ============================================================

pub fn matrix3_transpose(m: &Mat3) -> Mat3 {
    let mut out = [[0.0f32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = m[j][i];
        }
    }
    out
}

/// out = m1 * m2
pub fn matrix3_multiply(m1: &Mat3, m2: &Mat3) -> Mat3 {
    let mut out = [[0.0f32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = m1[i][0] * m2[0][j] + m1[i][1] * m2[1][j] + m1[i][2] * m2[2][j];
        }
    }
    out
}

pub fn matrix3_transform_vector(m: &Mat3, v: &Vec3) -> Vec3 {
    [dot_product(&m[0], v), dot_product(&m[1], v), dot_product(&m[2], v)]
}

/// Re-orthonormalize an axis after reflection.
pub fn matrix3_normalize(m: &mut Mat3) {
    vector_normalize(&mut m[AXIS_FORWARD]);
    vector_normalize(&mut m[AXIS_RIGHT]);
    vector_normalize(&mut m[AXIS_UP]);
}

pub fn matrix3_compare(a: &Mat3, b: &Mat3) -> bool {
    vector_compare(&a[0], &b[0]) && vector_compare(&a[1], &b[1]) && vector_compare(&a[2], &b[2])
}

/// Build an axis whose forward vector is `forward` (assumed normalized).
pub fn normal_vector_to_axis(forward: &Vec3) -> Mat3 {
    let mut axis = [[0.0f32; 3]; 3];
    axis[AXIS_FORWARD] = *forward;
    if forward[0] != 0.0 || forward[1] != 0.0 {
        axis[AXIS_RIGHT] = [forward[1], -forward[0], 0.0];
        vector_normalize(&mut axis[AXIS_RIGHT]);
    } else {
        axis[AXIS_RIGHT] = [1.0, 0.0, 0.0];
    }
    axis[AXIS_UP] = cross_product(&axis[AXIS_RIGHT], &axis[AXIS_FORWARD]);
    axis
}

/// Find a vector perpendicular to `src` (assumed normalized).
pub fn perpendicular_vector(src: &Vec3) -> Vec3 {
    let mut min_elem: f32 = 1.0;
    let mut pos = 0;
    for (i, c) in src.iter().enumerate() {
        if c.abs() < min_elem {
            pos = i;
            min_elem = c.abs();
        }
    }
    let mut tempvec = [0.0f32; 3];
    tempvec[pos] = 1.0;

    // project onto the plane through the origin with normal `src`
    let inv_denom = 1.0 / dot_product(src, src);
    let d = dot_product(src, &tempvec) * inv_denom;
    let mut dst = vector_ma(&tempvec, -d * inv_denom, src);
    vector_normalize(&mut dst);
    dst
}

pub fn rotate_point_around_vector(dir: &Vec3, point: &Vec3, degrees: f32) -> Vec3 {
    let vr = perpendicular_vector(dir);
    let vup = cross_product(&vr, dir);

    let m: Mat3 = [
        [vr[0], vup[0], dir[0]],
        [vr[1], vup[1], dir[1]],
        [vr[2], vup[2], dir[2]],
    ];
    let im = matrix3_transpose(&m);

    let rad = degrees.to_radians();
    let (s, c) = rad.sin_cos();
    let zrot: Mat3 = [[c, s, 0.0], [-s, c, 0.0], [0.0, 0.0, 1.0]];

    let rot = matrix3_multiply(&matrix3_multiply(&m, &zrot), &im);
    matrix3_transform_vector(&rot, point)
}

// ============================================================
// Plane operations
// ============================================================

/// Fill in plane type and sign bits for fast box tests.
pub fn categorize_plane(plane: &mut CPlane) {
    plane.signbits = 0;
    plane.plane_type = PLANE_NONAXIAL;
    for i in 0..3 {
        if plane.normal[i] < 0.0 {
            plane.signbits |= 1 << i;
        }
        if plane.normal[i] == 1.0 {
            plane.signbits = 0;
            plane.plane_type = i as u8;
            break;
        }
    }
}

/// Plane through three points, counter-clockwise winding faces the viewer.
pub fn plane_from_points(verts: &[Vec3; 3]) -> CPlane {
    let v1 = vector_subtract(&verts[1], &verts[0]);
    let v2 = vector_subtract(&verts[2], &verts[0]);
    let mut normal = cross_product(&v2, &v1);
    vector_normalize(&mut normal);
    let dist = dot_product(&verts[0], &normal);
    CPlane::new(normal, dist)
}

/// Signed distance of a point from the plane.
#[inline]
pub fn plane_diff(point: &Vec3, plane: &CPlane) -> f32 {
    if plane.plane_type < PLANE_NONAXIAL {
        point[plane.plane_type as usize] - plane.dist
    } else {
        dot_product(point, &plane.normal) - plane.dist
    }
}

/// Returns 1 (front), 2 (back), or 3 (crossing) for a box vs. plane test.
pub fn box_on_plane_side(emins: &Vec3, emaxs: &Vec3, p: &CPlane) -> i32 {
    // fast axial cases
    if p.plane_type < PLANE_NONAXIAL {
        let t = p.plane_type as usize;
        if p.dist <= emins[t] {
            return 1;
        }
        if p.dist >= emaxs[t] {
            return 2;
        }
        return 3;
    }

    let mut near = [0.0f32; 3];
    let mut far = [0.0f32; 3];
    for i in 0..3 {
        if p.signbits & (1 << i) != 0 {
            far[i] = emins[i];
            near[i] = emaxs[i];
        } else {
            far[i] = emaxs[i];
            near[i] = emins[i];
        }
    }
    let dist1 = dot_product(&p.normal, &far);
    let dist2 = dot_product(&p.normal, &near);

    let mut sides = 0;
    if dist1 >= p.dist {
        sides = 1;
    }
    if dist2 < p.dist {
        sides |= 2;
    }
    sides
}
