use half::f16;

use crate::math::{clamp_u8, quat_normalize, Vec3};

/// Size of one record in the raw `.splat` stream.
pub const RECORD_SIZE: usize = 32;

/// Numbers per point in each packed attribute buffer (one RGBA texel).
pub const TEXEL_LANES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Splat {
    pub position: Vec3,
    pub color: [u8; 3],
    pub opacity: f32,
    pub scale: Vec3,
    /// Quaternion, `[w, x, y, z]`.
    pub rotation: [f32; 4],
}

/// Typed per-point attribute arrays as handed over by a format decoder.
///
/// `colors` holds RGBA bytes (4 per point) when `alphas` is `None`, and RGB
/// bytes (3 per point) when opacity travels separately in `alphas`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplatAttributes {
    pub positions: Vec<f32>,
    pub scales: Vec<f32>,
    pub rotations: Vec<f32>,
    pub colors: Vec<u8>,
    pub alphas: Option<Vec<u8>>,
}

impl SplatAttributes {
    pub fn len(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn color_stride(&self) -> usize {
        if self.alphas.is_some() {
            3
        } else {
            4
        }
    }

    /// Checks that every array agrees on the point count and returns it.
    pub fn validate(&self) -> Result<usize, String> {
        if self.positions.len() % 3 != 0 {
            return Err(format!(
                "positions length {} is not a multiple of 3",
                self.positions.len()
            ));
        }
        let n = self.len();
        let checks = [
            ("scales", self.scales.len(), n * 3),
            ("rotations", self.rotations.len(), n * 4),
            ("colors", self.colors.len(), n * self.color_stride()),
        ];
        for (name, have, want) in checks {
            if have != want {
                return Err(format!("{name} has {have} values, expected {want} for {n} points"));
            }
        }
        if let Some(alphas) = &self.alphas {
            if alphas.len() != n {
                return Err(format!("alphas has {} values, expected {n}", alphas.len()));
            }
        }
        Ok(n)
    }

    /// Keeps the first `n` points of every array.
    pub fn truncate(&mut self, n: usize) {
        let stride = self.color_stride();
        self.positions.truncate(n * 3);
        self.scales.truncate(n * 3);
        self.rotations.truncate(n * 4);
        self.colors.truncate(n * stride);
        if let Some(alphas) = &mut self.alphas {
            alphas.truncate(n);
        }
    }

    pub fn from_splats(splats: &[Splat]) -> Self {
        let mut attrs = Self {
            positions: Vec::with_capacity(splats.len() * 3),
            scales: Vec::with_capacity(splats.len() * 3),
            rotations: Vec::with_capacity(splats.len() * 4),
            colors: Vec::with_capacity(splats.len() * 4),
            alphas: None,
        };
        for s in splats {
            attrs.positions.extend_from_slice(&s.position.to_array());
            attrs.scales.extend_from_slice(&s.scale.to_array());
            attrs.rotations.extend_from_slice(&s.rotation);
            attrs.colors.extend_from_slice(&s.color);
            attrs.colors.push(clamp_u8(s.opacity * 255.0));
        }
        attrs
    }

    /// Reads point `i` back as a [`Splat`]. Caller guarantees `i < len()`.
    pub fn splat(&self, i: usize) -> Splat {
        let p = &self.positions[i * 3..i * 3 + 3];
        let s = &self.scales[i * 3..i * 3 + 3];
        let r = &self.rotations[i * 4..i * 4 + 4];
        let stride = self.color_stride();
        let c = &self.colors[i * stride..i * stride + stride];
        let alpha = match &self.alphas {
            Some(alphas) => alphas[i],
            None => c[3],
        };
        Splat {
            position: Vec3::new(p[0], p[1], p[2]),
            color: [c[0], c[1], c[2]],
            opacity: alpha as f32 / 255.0,
            scale: Vec3::new(s[0], s[1], s[2]),
            rotation: quat_normalize([r[0], r[1], r[2], r[3]]),
        }
    }
}

fn read_vec3_f32(bytes: &[u8]) -> Vec3 {
    let x = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let y = f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let z = f32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    Vec3::new(x, y, z)
}

fn decode_scale_value(v: f32) -> f32 {
    if v > 0.0 {
        v
    } else {
        v.exp().max(1e-4)
    }
}

/// Decodes one 32-byte `.splat` record: f32 xyz, f32 scale xyz, rgba bytes,
/// quaternion bytes mapped from `[0, 255]` to `[-1, 1]`.
pub fn decode_record(chunk: &[u8]) -> Splat {
    let position = read_vec3_f32(&chunk[0..12]);
    let scale_raw = read_vec3_f32(&chunk[12..24]);
    let color = [chunk[24], chunk[25], chunk[26]];
    let opacity = (chunk[27] as f32 / 255.0).clamp(0.0, 1.0);

    let rotation = quat_normalize([
        chunk[28] as f32 / 127.5 - 1.0,
        chunk[29] as f32 / 127.5 - 1.0,
        chunk[30] as f32 / 127.5 - 1.0,
        chunk[31] as f32 / 127.5 - 1.0,
    ]);

    Splat {
        position,
        color,
        opacity,
        scale: Vec3::new(
            decode_scale_value(scale_raw.x),
            decode_scale_value(scale_raw.y),
            decode_scale_value(scale_raw.z),
        ),
        rotation,
    }
}

pub fn encode_record(splat: &Splat, out: &mut Vec<u8>) {
    for v in splat.position.to_array().into_iter().chain(splat.scale.to_array()) {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&splat.color);
    out.push(clamp_u8(splat.opacity * 255.0));
    for q in splat.rotation {
        out.push(clamp_u8((q + 1.0) * 127.5));
    }
}

pub fn encode_records(splats: &[Splat]) -> Vec<u8> {
    let mut out = Vec::with_capacity(splats.len() * RECORD_SIZE);
    for splat in splats {
        encode_record(splat, &mut out);
    }
    out
}

pub fn pack_half2(a: f32, b: f32) -> u32 {
    let lo = f16::from_f32(a).to_bits() as u32;
    let hi = f16::from_f32(b).to_bits() as u32;
    lo | (hi << 16)
}

pub fn unpack_half2(v: u32) -> (f32, f32) {
    (
        f16::from_bits((v & 0xFFFF) as u16).to_f32(),
        f16::from_bits((v >> 16) as u16).to_f32(),
    )
}

pub fn pack_rgba(color: [u8; 3], opacity: f32) -> u32 {
    u32::from_le_bytes([color[0], color[1], color[2], clamp_u8(opacity * 255.0)])
}

/// Packs one splat into its float texel `[x, y, z, scale_x]` and integer
/// texel `[half2(scale_y, scale_z), half2(w, x), half2(y, z), rgba8]`.
pub fn pack_texels(splat: &Splat) -> ([f32; 4], [u32; 4]) {
    let r = splat.rotation;
    (
        [splat.position.x, splat.position.y, splat.position.z, splat.scale.x],
        [
            pack_half2(splat.scale.y, splat.scale.z),
            pack_half2(r[0], r[1]),
            pack_half2(r[2], r[3]),
            pack_rgba(splat.color, splat.opacity),
        ],
    )
}

/// Inverse of [`pack_texels`], at half precision for the packed lanes.
pub fn unpack_texels(center_and_scale: &[f32], rotation_and_color: &[u32]) -> Splat {
    let (sy, sz) = unpack_half2(rotation_and_color[0]);
    let (w, x) = unpack_half2(rotation_and_color[1]);
    let (y, z) = unpack_half2(rotation_and_color[2]);
    let [cr, cg, cb, ca] = rotation_and_color[3].to_le_bytes();
    Splat {
        position: Vec3::new(center_and_scale[0], center_and_scale[1], center_and_scale[2]),
        color: [cr, cg, cb],
        opacity: ca as f32 / 255.0,
        scale: Vec3::new(center_and_scale[3], sy, sz),
        rotation: [w, x, y, z],
    }
}
