use crate::error::ImageError;
use crate::image::Image;

/// A closed polygon over image coordinates.
#[derive(Debug, Clone, Default)]
pub struct Polygon {
    points: Vec<[f64; 2]>,
}

impl Polygon {
    /// Create a polygon from its vertices, in order.
    pub fn new(points: Vec<[f64; 2]>) -> Self {
        Self { points }
    }

    /// The vertices.
    pub fn points(&self) -> &[[f64; 2]] {
        &self.points
    }

    /// True when the polygon has no vertices.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Even-odd containment test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.points[i];
            let [xj, yj] = self.points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Axis-aligned bounds as `[x0, y0, x1, y1]`, or `None` when empty.
    pub fn bounds(&self) -> Option<[f64; 4]> {
        let first = self.points.first()?;
        let mut b = [first[0], first[1], first[0], first[1]];
        for p in &self.points {
            b[0] = b[0].min(p[0]);
            b[1] = b[1].min(p[1]);
            b[2] = b[2].max(p[0]);
            b[3] = b[3].max(p[1]);
        }
        Some(b)
    }
}

/// Boolean region predicate aligned to one raster's pixel grid.
///
/// The default mask covers the whole image: every in-range query is
/// true and every out-of-range query is false, which is the bootstrap
/// behavior an absent mask must have.
#[derive(Debug, Clone)]
pub struct Mask {
    width: usize,
    height: usize,
    inside: Vec<bool>,
    polygon: Option<Polygon>,
}

impl Mask {
    /// Create the all-inside mask for a `width` x `height` raster.
    pub fn all_inside(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            inside: vec![true; width * height],
            polygon: None,
        }
    }

    /// Derive a mask from a raster: non-zero samples are inside.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::SizeMismatch`] when the raster size differs
    /// from the expected mask dimensions.
    pub fn from_raster(image: &Image, width: usize, height: usize) -> Result<Self, ImageError> {
        if image.width() != width || image.height() != height {
            return Err(ImageError::SizeMismatch(
                width,
                height,
                image.width(),
                image.height(),
            ));
        }
        Ok(Self {
            width,
            height,
            inside: image.as_slice().iter().map(|&v| v != 0.0).collect(),
            polygon: None,
        })
    }

    /// Mask width in pixels.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Mask height in pixels.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Membership at a real-valued coordinate: the nearest sample is
    /// looked up, and everything outside the raster is false.
    #[inline]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let u = x.round() as i64;
        let v = y.round() as i64;
        if u < 0 || u >= self.width as i64 || v < 0 || v >= self.height as i64 {
            return false;
        }
        self.inside[v as usize * self.width + u as usize]
    }

    /// Set a single sample; out-of-range coordinates are ignored.
    pub fn set(&mut self, u: i64, v: i64, value: bool) {
        if u >= 0 && u < self.width as i64 && v >= 0 && v < self.height as i64 {
            self.inside[v as usize * self.width + u as usize] = value;
        }
    }

    /// Reset every sample to inside and drop the polygon.
    pub fn clear(&mut self) {
        self.inside.fill(true);
        self.polygon = None;
    }

    /// Rasterize a polygon into the mask, replacing its contents.
    /// With `invert`, membership is complemented.
    pub fn fill(&mut self, polygon: Polygon, invert: bool) {
        let mut k = 0;
        for y in 0..self.height {
            for x in 0..self.width {
                let mut inside = polygon.contains(x as f64, y as f64);
                if invert {
                    inside = !inside;
                }
                self.inside[k] = inside;
                k += 1;
            }
        }
        self.polygon = Some(polygon);
    }

    /// Bounding box `[x0, y0, x1, y1]` of the attached polygon, or the
    /// whole raster when none is attached.
    pub fn bounding_box(&self) -> [usize; 4] {
        if let Some(polygon) = &self.polygon {
            if let Some(b) = polygon.bounds() {
                return [
                    b[0].floor().max(0.0) as usize,
                    b[1].floor().max(0.0) as usize,
                    (b[2].ceil() as usize).min(self.width),
                    (b[3].ceil() as usize).min(self.height),
                ];
            }
        }
        [0, 0, self.width, self.height]
    }
}
