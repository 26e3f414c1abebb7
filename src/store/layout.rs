/// Shape of the two packed attribute textures for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureLayout {
    pub width: u32,
    pub height: u32,
}

/// A rectangle of texels written since the last upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexelRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TextureLayout {
    /// `width = min(points, limit)`, `height = ceil(points / width)`.
    /// Zero points gives a 0x0 layout.
    pub fn for_points(points: u32, limit: u32) -> Self {
        let width = points.min(limit.max(1));
        if width == 0 {
            return Self::default();
        }
        Self {
            width,
            height: points.div_ceil(width),
        }
    }

    pub fn capacity(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn position(&self, index: u32) -> (u32, u32) {
        (index % self.width, index / self.width)
    }

    /// Rectangles covering texels `[start, start + count)`: a partial first
    /// row, a block of whole rows, and a partial last row, each only when
    /// non-empty.
    pub fn regions(&self, start: u32, count: u32) -> Vec<TexelRegion> {
        let mut out = Vec::with_capacity(3);
        if count == 0 || self.width == 0 {
            return out;
        }
        let end = start + count;
        let (x0, y0) = self.position(start);
        let (x1, y1) = self.position(end);

        if y0 == y1 {
            out.push(TexelRegion {
                x: x0,
                y: y0,
                width: count,
                height: 1,
            });
            return out;
        }

        let mut row = y0;
        if x0 > 0 {
            out.push(TexelRegion {
                x: x0,
                y: y0,
                width: self.width - x0,
                height: 1,
            });
            row += 1;
        }
        if y1 > row {
            out.push(TexelRegion {
                x: 0,
                y: row,
                width: self.width,
                height: y1 - row,
            });
        }
        if x1 > 0 {
            out.push(TexelRegion {
                x: 0,
                y: y1,
                width: x1,
                height: 1,
            });
        }
        out
    }
}
