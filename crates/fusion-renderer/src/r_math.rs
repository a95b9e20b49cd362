// r_math.rs — 4x4 column-major matrices, view frustum and culling

use fusion_common::q_shared::{
    dot_product, rotate_point_around_vector, vector_negate, CPlane, Mat3, Vec3, AXIS_FORWARD,
    AXIS_RIGHT, AXIS_UP,
};

pub type Mat4 = [f32; 16];

pub const MAT4_IDENTITY: Mat4 = [
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 1.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
];

/// Converts from Quake's x-forward, z-up frame to GL's eye frame.
const QUAKE_FLIP: Mat4 = [
    0.0, 0.0, -1.0, 0.0,
    -1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
];

pub const DEPTH_EPSILON: f32 = 1.0 / (1 << 22) as f32;

pub fn matrix4_multiply(m1: &Mat4, m2: &Mat4) -> Mat4 {
    let mut out = [0.0; 16];
    for col in 0..4 {
        for row in 0..4 {
            out[col * 4 + row] = m1[row] * m2[col * 4]
                + m1[4 + row] * m2[col * 4 + 1]
                + m1[8 + row] * m2[col * 4 + 2]
                + m1[12 + row] * m2[col * 4 + 3];
        }
    }
    out
}

/// Transforms a point (w = 1).
pub fn matrix4_transform_point(m: &Mat4, v: &Vec3) -> Vec3 {
    [
        m[0] * v[0] + m[4] * v[1] + m[8] * v[2] + m[12],
        m[1] * v[0] + m[5] * v[1] + m[9] * v[2] + m[13],
        m[2] * v[0] + m[6] * v[1] + m[10] * v[2] + m[14],
    ]
}

pub fn matrix4_modelview(view_org: &Vec3, view_axis: &Mat3) -> Mat4 {
    let mut m = [0.0; 16];
    for row in 0..3 {
        let axis = &view_axis[row];
        m[row] = axis[0];
        m[4 + row] = axis[1];
        m[8 + row] = axis[2];
        m[12 + row] = -view_org[0] * axis[0] - view_org[1] * axis[1] - view_org[2] * axis[2];
    }
    m[15] = 1.0;
    m
}

/// Camera matrix for a Quake-space view.
pub fn matrix4_quake_modelview(view_org: &Vec3, view_axis: &Mat3) -> Mat4 {
    matrix4_multiply(&QUAKE_FLIP, &matrix4_modelview(view_org, view_axis))
}

pub fn matrix4_perspective_projection(fov_x: f32, fov_y: f32, near: f32, far: f32) -> Mat4 {
    let mut m = [0.0; 16];
    m[0] = 1.0 / (fov_x.to_radians() * 0.5).tan();
    m[5] = 1.0 / (fov_y.to_radians() * 0.5).tan();
    m[10] = -(far + near) / (far - near);
    m[11] = -1.0;
    m[14] = -2.0 * far * near / (far - near);
    m
}

/// Pushes the far plane of a perspective projection to infinity.
pub fn matrix4_perspective_projection_to_infinity(near: f32, m: &mut Mat4, epsilon: f32) {
    m[10] = epsilon - 1.0;
    m[11] = -1.0;
    m[14] = (epsilon - 2.0) * near;
}

pub fn matrix4_ortho_projection(
    left: f32,
    right: f32,
    bottom: f32,
    top: f32,
    near: f32,
    far: f32,
) -> Mat4 {
    let mut m = [0.0; 16];
    m[0] = 2.0 / (right - left);
    m[5] = 2.0 / (top - bottom);
    m[10] = -2.0 / (far - near);
    m[12] = -(right + left) / (right - left);
    m[13] = -(top + bottom) / (top - bottom);
    m[14] = -(far + near) / (far - near);
    m[15] = 1.0;
    m
}

/// Object-to-world transform for an entity.
pub fn matrix4_object_matrix(origin: &Vec3, axis: &Mat3, scale: f32) -> Mat4 {
    let mut m = [0.0; 16];
    for col in 0..3 {
        for row in 0..3 {
            m[col * 4 + row] = axis[col][row] * scale;
        }
    }
    m[12] = origin[0];
    m[13] = origin[1];
    m[14] = origin[2];
    m[15] = 1.0;
    m
}

// ============================================================
// Frustum
// ============================================================

/// Builds the six frustum planes: right, left, up, down, near, far.
pub fn setup_frustum(
    vieworg: &Vec3,
    viewaxis: &Mat3,
    fov_x: f32,
    fov_y: f32,
    near_clip: f32,
    far_clip: f32,
) -> [CPlane; 6] {
    let forward = viewaxis[AXIS_FORWARD];
    let left = viewaxis[AXIS_RIGHT];
    let up = viewaxis[AXIS_UP];
    let right = vector_negate(&left);

    let normals = [
        rotate_point_around_vector(&up, &forward, -(90.0 - fov_x / 2.0)),
        rotate_point_around_vector(&up, &forward, 90.0 - fov_x / 2.0),
        rotate_point_around_vector(&right, &forward, 90.0 - fov_y / 2.0),
        rotate_point_around_vector(&right, &forward, -(90.0 - fov_y / 2.0)),
    ];

    let mut frustum = [CPlane::default(); 6];
    for (plane, normal) in frustum.iter_mut().zip(normals.iter()) {
        *plane = CPlane::new(*normal, dot_product(vieworg, normal));
    }
    frustum[4] = CPlane::new(forward, dot_product(vieworg, &forward) + near_clip);
    let back = vector_negate(&forward);
    frustum[5] = CPlane::new(back, dot_product(vieworg, &back) - far_clip);
    frustum
}

/// True if the box is completely outside one of the enabled planes.
pub fn cull_box(frustum: &[CPlane], mins: &Vec3, maxs: &Vec3, clip_flags: u32) -> bool {
    let clip_flags = clip_flags & 63;
    for (i, p) in frustum.iter().enumerate() {
        if clip_flags & (1 << i) == 0 {
            continue;
        }
        let mut corner = [0.0; 3];
        for j in 0..3 {
            corner[j] = if p.signbits & (1 << j) != 0 { mins[j] } else { maxs[j] };
        }
        if dot_product(&p.normal, &corner) < p.dist {
            return true;
        }
    }
    false
}

/// True if the sphere is completely outside one of the enabled planes.
pub fn cull_sphere(frustum: &[CPlane], centre: &Vec3, radius: f32, clip_flags: u32) -> bool {
    let clip_flags = clip_flags & 63;
    frustum.iter().enumerate().any(|(i, p)| {
        clip_flags & (1 << i) != 0 && dot_product(centre, &p.normal) - p.dist <= -radius
    })
}
