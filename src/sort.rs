use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthEntry {
    pub depth: f32,
    pub index: u32,
}

/// Distance in front of the camera: the negated view-space z of `center`,
/// where `view` is the third row of the model-view matrix.
pub fn view_depth(view: &[f32; 4], center: &[f32]) -> f32 {
    -(view[0] * center[0] + view[1] * center[1] + view[2] * center[2] + view[3])
}

pub fn inside_frustum(planes: &[[f32; 4]; 6], center: &[f32]) -> bool {
    planes
        .iter()
        .all(|p| p[0] * center[0] + p[1] * center[1] + p[2] * center[2] + p[3] >= 0.0)
}

/// Farthest first, so alpha blending composites correctly.
pub fn sort_back_to_front(entries: &mut [DepthEntry]) {
    entries.par_sort_unstable_by(|a, b| {
        b.depth
            .partial_cmp(&a.depth)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Builds the draw order for `centers` (xyz triples): points whose depth
/// falls below `threshold` or outside `planes` are dropped, the rest are
/// ordered back to front.
pub fn depth_order(
    centers: &[f32],
    view: &[f32; 4],
    planes: Option<&[[f32; 4]; 6]>,
    threshold: f32,
) -> Vec<u32> {
    let mut entries: Vec<DepthEntry> = centers
        .par_chunks_exact(3)
        .enumerate()
        .filter_map(|(i, c)| {
            let depth = view_depth(view, c);
            if depth < threshold {
                return None;
            }
            if let Some(planes) = planes {
                if !inside_frustum(planes, c) {
                    return None;
                }
            }
            Some(DepthEntry {
                depth,
                index: i as u32,
            })
        })
        .collect();

    sort_back_to_front(&mut entries);
    entries.into_iter().map(|e| e.index).collect()
}
