use std::ops::{Add, AddAssign, Mul, Neg, Sub};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn length_squared(self) -> f32 {
        self.dot(self)
    }

    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }

    pub fn normalize(self) -> Self {
        let len = self.length();
        if len <= 1e-12 {
            return Self::ZERO;
        }
        self * (1.0 / len)
    }

    pub fn min(self, other: Self) -> Self {
        Self::new(self.x.min(other.x), self.y.min(other.y), self.z.min(other.z))
    }

    pub fn max(self, other: Self) -> Self {
        Self::new(self.x.max(other.x), self.y.max(other.y), self.z.max(other.z))
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

impl Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vec3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// Column-major 4x4 matrix, laid out the way GPU uniforms expect it.
///
/// Equality is exact element-wise float comparison: two matrices that differ
/// by a single ulp are different views.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat4 {
    pub elements: [f32; 16],
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mat4 {
    pub const IDENTITY: Self = Self {
        elements: [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ],
    };

    pub const fn from_cols_array(elements: [f32; 16]) -> Self {
        Self { elements }
    }

    pub fn from_translation(t: Vec3) -> Self {
        let mut m = Self::IDENTITY;
        m.elements[12] = t.x;
        m.elements[13] = t.y;
        m.elements[14] = t.z;
        m
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.elements[col * 4 + row]
    }

    pub fn row(&self, row: usize) -> [f32; 4] {
        [
            self.elements[row],
            self.elements[4 + row],
            self.elements[8 + row],
            self.elements[12 + row],
        ]
    }

    pub fn mul_mat(&self, rhs: &Self) -> Self {
        let mut out = [0.0_f32; 16];
        for col in 0..4 {
            for row in 0..4 {
                out[col * 4 + row] = (0..4).map(|k| self.get(row, k) * rhs.get(k, col)).sum();
            }
        }
        Self::from_cols_array(out)
    }

    /// Transforms a point (w = 1) and returns the homogeneous result.
    pub fn transform_point4(&self, p: Vec3) -> [f32; 4] {
        let v = [p.x, p.y, p.z, 1.0];
        let mut out = [0.0_f32; 4];
        for (row, slot) in out.iter_mut().enumerate() {
            *slot = (0..4).map(|k| self.get(row, k) * v[k]).sum();
        }
        out
    }

    /// Right-handed view matrix: the camera looks down its local -Z.
    pub fn look_to(eye: Vec3, forward: Vec3, up: Vec3) -> Self {
        let f = forward.normalize();
        let r = f.cross(up).normalize();
        let u = r.cross(f);
        Self::from_cols_array([
            r.x, u.x, -f.x, 0.0, //
            r.y, u.y, -f.y, 0.0, //
            r.z, u.z, -f.z, 0.0, //
            -r.dot(eye), -u.dot(eye), f.dot(eye), 1.0,
        ])
    }

    /// OpenGL-style perspective projection (clip z in [-w, w]).
    pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        let f = 1.0 / (fov_y * 0.5).tan().max(1e-6);
        let aspect = aspect.max(1e-6);
        let range = near - far;
        Self::from_cols_array([
            f / aspect, 0.0, 0.0, 0.0, //
            0.0, f, 0.0, 0.0, //
            0.0, 0.0, (far + near) / range, -1.0, //
            0.0, 0.0, 2.0 * far * near / range, 0.0,
        ])
    }

    /// Extracts the six clip planes `[nx, ny, nz, d]` (left, right, bottom,
    /// top, near, far) of a combined projection * view matrix. A point is
    /// inside when `n . p + d >= 0` for every plane.
    pub fn frustum_planes(&self) -> [[f32; 4]; 6] {
        let r0 = self.row(0);
        let r1 = self.row(1);
        let r2 = self.row(2);
        let r3 = self.row(3);
        let combine = |sign: f32, r: [f32; 4]| -> [f32; 4] {
            let mut p = [0.0_f32; 4];
            for i in 0..4 {
                p[i] = r3[i] + sign * r[i];
            }
            let len = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
            if len > 1e-12 {
                for v in &mut p {
                    *v /= len;
                }
            }
            p
        };
        [
            combine(1.0, r0),
            combine(-1.0, r0),
            combine(1.0, r1),
            combine(-1.0, r1),
            combine(1.0, r2),
            combine(-1.0, r2),
        ]
    }
}

pub fn quat_normalize(q: [f32; 4]) -> [f32; 4] {
    let len = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
    if len <= 1e-12 {
        return [1.0, 0.0, 0.0, 0.0];
    }
    [q[0] / len, q[1] / len, q[2] / len, q[3] / len]
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

pub fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> [u8; 3] {
    let h = hue.rem_euclid(360.0) / 60.0;
    let c = value * saturation;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let m = value - c;
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [
        clamp_u8((r + m) * 255.0),
        clamp_u8((g + m) * 255.0),
        clamp_u8((b + m) * 255.0),
    ]
}
