//! Procedural scenes for running without an input file.

use rand::Rng;
use std::f32::consts::TAU;
use crate::math::{clamp_u8, hsv_to_rgb, Vec3};
use crate::splat::Splat;

const KNOT_P: f32 = 2.0;
const KNOT_Q: f32 = 3.0;
const KNOT_MAJOR: f32 = 1.4;
const KNOT_MINOR: f32 = 0.38;

const CLUSTERS: [(Vec3, [u8; 3]); 4] = [
    (Vec3::new(1.8, 0.3, 0.4), [255, 120, 80]),
    (Vec3::new(-1.6, -0.2, 0.8), [100, 210, 255]),
    (Vec3::new(0.3, 1.2, -1.6), [160, 255, 130]),
    (Vec3::new(-0.5, -1.0, -1.4), [255, 220, 90]),
];

fn random_sphere_point(rng: &mut impl Rng) -> Vec3 {
    let z = rng.random_range(-1.0_f32..1.0_f32);
    let theta = rng.random_range(0.0_f32..TAU);
    let r = (1.0 - z * z).sqrt();
    Vec3::new(r * theta.cos(), z, r * theta.sin())
}

fn jitter(rng: &mut impl Rng, amount: f32) -> Vec3 {
    Vec3::new(
        rng.random_range(-amount..amount),
        rng.random_range(-amount..amount),
        rng.random_range(-amount..amount),
    )
}

/// A unit quaternion `[w, x, y, z]` about a random axis.
fn random_rotation(rng: &mut impl Rng) -> [f32; 4] {
    let axis = random_sphere_point(rng);
    let half = rng.random_range(0.0_f32..TAU) * 0.5;
    let s = half.sin();
    [half.cos(), axis.x * s, axis.y * s, axis.z * s]
}

/// Slightly elongated along y so rotations are visible in the packed data.
fn blob(rng: &mut impl Rng, position: Vec3, color: [u8; 3], size: (f32, f32), stretch: (f32, f32)) -> Splat {
    let scale = rng.random_range(size.0..size.1);
    Splat {
        position,
        color,
        opacity: rng.random_range(0.6_f32..0.95_f32),
        scale: Vec3::new(scale, scale * rng.random_range(stretch.0..stretch.1), scale),
        rotation: random_rotation(rng),
    }
}

fn knot_point(t: f32) -> Vec3 {
    let ring = KNOT_MAJOR + KNOT_MINOR * (KNOT_Q * t).cos();
    // XZ plane, Y up.
    Vec3::new(
        ring * (KNOT_P * t).cos(),
        KNOT_MINOR * (KNOT_Q * t).sin(),
        ring * (KNOT_P * t).sin(),
    )
}

fn torus_knot(rng: &mut impl Rng, count: usize) -> Vec<Splat> {
    (0..count)
        .map(|i| {
            let t = i as f32 / count.max(1) as f32 * TAU * 2.0;
            let hue = ((KNOT_Q * t).sin() * 0.5 + 0.5) * 360.0;
            let position = knot_point(t) + jitter(rng, 0.04);
            blob(rng, position, hsv_to_rgb(hue, 0.80, 0.95), (0.018, 0.042), (0.9, 1.2))
        })
        .collect()
}

fn sphere_clusters(rng: &mut impl Rng, count: usize) -> Vec<Splat> {
    (0..count)
        .map(|i| {
            let (center, tint) = CLUSTERS[i % CLUSTERS.len()];
            let radius = rng.random::<f32>().cbrt() * rng.random_range(0.5_f32..1.4_f32);
            let position = center + random_sphere_point(rng) * radius + jitter(rng, 0.03);
            let color = tint.map(|c| clamp_u8(c as f32 + rng.random_range(-25.0_f32..25.0_f32)));
            blob(rng, position, color, (0.02, 0.06), (0.8, 1.3))
        })
        .collect()
}

/// Two thirds torus knot, one third sphere clusters.
pub fn generate_demo_splats(rng: &mut impl Rng, count: usize) -> Vec<Splat> {
    let knot = count * 2 / 3;
    let mut splats = torus_knot(rng, knot);
    splats.extend(sphere_clusters(rng, count - knot));
    splats
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn seeded_scene_is_reproducible() {
        let a = generate_demo_splats(&mut StdRng::seed_from_u64(7), 300);
        let b = generate_demo_splats(&mut StdRng::seed_from_u64(7), 300);
        assert_eq!(a.len(), 300);
        assert_eq!(a, b);
    }

    #[test]
    fn scene_stays_near_origin() {
        let splats = generate_demo_splats(&mut StdRng::seed_from_u64(1), 900);
        assert!(splats.iter().all(|s| s.position.length() < 4.0));
        assert!(splats.iter().all(|s| (0.0..=1.0).contains(&s.opacity)));
    }
}
