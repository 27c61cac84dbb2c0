//! Rectangles, Damage Regions and Output Transforms
//!
//! Damage is a set of axis-aligned rectangles over the framebuffer pixel
//! grid. Transforms are the eight wl_output-style orientations a capture
//! source can deliver frames in; the resampler uses the math here to map
//! damage and pixels back into identity orientation.

/// An axis-aligned rectangle on the pixel grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    /// X coordinate of the left edge.
    pub x: u32,
    /// Y coordinate of the top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Create a new rectangle.
    #[inline]
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A rectangle covering a whole frame.
    #[inline]
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// X coordinate one past the right edge.
    #[inline]
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Y coordinate one past the bottom edge.
    #[inline]
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Area in pixels.
    #[inline]
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether this rectangle overlaps another.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right()
            && self.right() > other.x
            && self.y < other.bottom()
            && self.bottom() > other.y
    }

    /// Bounding box of two rectangles.
    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, right - x, bottom - y)
    }
}

/// A set of damaged rectangles.
///
/// Horizontally adjacent rectangles on the same row are coalesced as they
/// are added, which keeps the per-tile output of the damage refinery
/// compact. The empty region is legal everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    /// Create an empty region.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a region from a single rectangle.
    pub fn from_rect(rect: Rect) -> Self {
        Self { rects: vec![rect] }
    }

    /// Add a rectangle, merging it into the previous one when they form a
    /// contiguous horizontal run.
    pub fn add_rect(&mut self, rect: Rect) {
        if rect.width == 0 || rect.height == 0 {
            return;
        }
        if let Some(last) = self.rects.last_mut() {
            if last.y == rect.y && last.height == rect.height && last.right() == rect.x {
                last.width += rect.width;
                return;
            }
        }
        self.rects.push(rect);
    }

    /// Whether the region contains no rectangles.
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Number of rectangles.
    pub fn len(&self) -> usize {
        self.rects.len()
    }

    /// The rectangles of this region.
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Iterate over the rectangles.
    pub fn iter(&self) -> impl Iterator<Item = &Rect> {
        self.rects.iter()
    }

    /// Whether any rectangle overlaps `rect`.
    pub fn intersects_rect(&self, rect: &Rect) -> bool {
        self.rects.iter().any(|r| r.intersects(rect))
    }

    /// Bounding box of the whole region, if non-empty.
    pub fn bounding_rect(&self) -> Option<Rect> {
        let mut it = self.rects.iter();
        let first = *it.next()?;
        Some(it.fold(first, |acc, r| acc.union(r)))
    }

    /// Total damaged area in pixels, counting overlaps twice.
    pub fn area(&self) -> u64 {
        self.rects.iter().map(Rect::area).sum()
    }
}

/// Output transform of a captured frame, matching wl_output_transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    /// Identity.
    #[default]
    Normal,
    /// Rotated 90 degrees clockwise.
    Rot90,
    /// Rotated 180 degrees.
    Rot180,
    /// Rotated 270 degrees clockwise.
    Rot270,
    /// Mirrored about the vertical axis.
    Flipped,
    /// Mirrored, then rotated 90 degrees clockwise.
    Flipped90,
    /// Mirrored, then rotated 180 degrees.
    Flipped180,
    /// Mirrored, then rotated 270 degrees clockwise.
    Flipped270,
}

impl Transform {
    /// The transform that undoes this one.
    pub fn invert(self) -> Self {
        match self {
            Self::Rot90 => Self::Rot270,
            Self::Rot270 => Self::Rot90,
            // The mirrored variants are involutions.
            other => other,
        }
    }

    /// Whether width and height swap under this transform.
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Self::Rot90 | Self::Rot270 | Self::Flipped90 | Self::Flipped270
        )
    }

    /// Dimensions of the transformed frame.
    pub fn apply_to_dimensions(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Map a rectangle from source orientation into identity orientation.
    ///
    /// `width` and `height` are the source frame dimensions and the
    /// rectangle must lie within them.
    pub fn apply_to_rect(self, rect: Rect, width: u32, height: u32) -> Rect {
        let Rect {
            mut x,
            y,
            width: w,
            height: h,
        } = rect;
        debug_assert!(rect.right() <= width && rect.bottom() <= height);

        // The mirrored variants compose an x-axis mirror before the
        // rotation.
        let rotation = match self {
            Self::Normal | Self::Rot90 | Self::Rot180 | Self::Rot270 => self,
            Self::Flipped => {
                x = width - x - w;
                Self::Normal
            }
            Self::Flipped90 => {
                x = width - x - w;
                Self::Rot90
            }
            Self::Flipped180 => {
                x = width - x - w;
                Self::Rot180
            }
            Self::Flipped270 => {
                x = width - x - w;
                Self::Rot270
            }
        };

        match rotation {
            Self::Normal => Rect::new(x, y, w, h),
            Self::Rot90 => Rect::new(height - y - h, x, h, w),
            Self::Rot180 => Rect::new(width - x - w, height - y - h, w, h),
            Self::Rot270 => Rect::new(y, width - x - w, h, w),
            _ => unreachable!(),
        }
    }

    /// Map a single pixel coordinate from source orientation into
    /// identity orientation.
    #[inline]
    pub fn apply_to_point(self, x: u32, y: u32, width: u32, height: u32) -> (u32, u32) {
        let r = self.apply_to_rect(Rect::new(x, y, 1, 1), width, height);
        (r.x, r.y)
    }
}

/// Map a whole region from source orientation into identity orientation.
pub fn transform_region(region: &Region, transform: Transform, width: u32, height: u32) -> Region {
    if transform == Transform::Normal {
        return region.clone();
    }
    let mut out = Region::new();
    for rect in region.iter() {
        out.add_rect(transform.apply_to_rect(*rect, width, height));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TRANSFORMS: [Transform; 8] = [
        Transform::Normal,
        Transform::Rot90,
        Transform::Rot180,
        Transform::Rot270,
        Transform::Flipped,
        Transform::Flipped90,
        Transform::Flipped180,
        Transform::Flipped270,
    ];

    #[test]
    fn test_rect_basics() {
        let r = Rect::new(10, 20, 30, 40);
        assert_eq!(r.right(), 40);
        assert_eq!(r.bottom(), 60);
        assert_eq!(r.area(), 1200);
    }

    #[test]
    fn test_rect_intersects() {
        let a = Rect::new(0, 0, 100, 100);
        assert!(a.intersects(&Rect::new(50, 50, 100, 100)));
        assert!(!a.intersects(&Rect::new(100, 0, 10, 10))); // edge-adjacent
        assert!(!a.intersects(&Rect::new(200, 200, 10, 10)));
    }

    #[test]
    fn test_rect_union() {
        let u = Rect::new(0, 0, 50, 50).union(&Rect::new(30, 30, 50, 50));
        assert_eq!(u, Rect::new(0, 0, 80, 80));
    }

    #[test]
    fn test_region_merges_horizontal_runs() {
        let mut region = Region::new();
        region.add_rect(Rect::new(0, 0, 32, 32));
        region.add_rect(Rect::new(32, 0, 32, 32));
        region.add_rect(Rect::new(64, 0, 32, 32));
        assert_eq!(region.len(), 1);
        assert_eq!(region.rects()[0], Rect::new(0, 0, 96, 32));

        region.add_rect(Rect::new(0, 32, 32, 32));
        assert_eq!(region.len(), 2);
    }

    #[test]
    fn test_region_ignores_empty_rects() {
        let mut region = Region::new();
        region.add_rect(Rect::new(0, 0, 0, 32));
        region.add_rect(Rect::new(0, 0, 32, 0));
        assert!(region.is_empty());
    }

    #[test]
    fn test_region_bounding_rect() {
        let mut region = Region::new();
        assert_eq!(region.bounding_rect(), None);
        region.add_rect(Rect::new(10, 10, 10, 10));
        region.add_rect(Rect::new(50, 60, 10, 10));
        assert_eq!(region.bounding_rect(), Some(Rect::new(10, 10, 50, 60)));
    }

    #[test]
    fn test_transform_dimensions() {
        assert_eq!(Transform::Rot90.apply_to_dimensions(640, 480), (480, 640));
        assert_eq!(Transform::Rot180.apply_to_dimensions(640, 480), (640, 480));
        assert_eq!(
            Transform::Flipped270.apply_to_dimensions(640, 480),
            (480, 640)
        );
    }

    #[test]
    fn test_transform_rect_90() {
        // (x, y, w, h) -> (H - y - h, x, h, w)
        let r = Transform::Rot90.apply_to_rect(Rect::new(10, 20, 30, 40), 100, 200);
        assert_eq!(r, Rect::new(140, 10, 40, 30));
    }

    #[test]
    fn test_transform_rect_flipped() {
        let r = Transform::Flipped.apply_to_rect(Rect::new(10, 20, 30, 40), 100, 200);
        assert_eq!(r, Rect::new(60, 20, 30, 40));
    }

    #[test]
    fn test_transform_round_trip() {
        let (width, height) = (100u32, 200u32);
        let rects = [
            Rect::new(0, 0, 100, 200),
            Rect::new(10, 20, 30, 40),
            Rect::new(99, 199, 1, 1),
            Rect::new(0, 150, 64, 50),
        ];
        for t in ALL_TRANSFORMS {
            let (tw, th) = t.apply_to_dimensions(width, height);
            for rect in rects {
                let there = t.apply_to_rect(rect, width, height);
                let back = t.invert().apply_to_rect(there, tw, th);
                assert_eq!(back, rect, "round trip failed for {t:?} on {rect:?}");
            }
        }
    }

    #[test]
    fn test_transform_point_matches_rect() {
        for t in ALL_TRANSFORMS {
            let (x, y) = t.apply_to_point(3, 5, 10, 20);
            let r = t.apply_to_rect(Rect::new(3, 5, 1, 1), 10, 20);
            assert_eq!((x, y), (r.x, r.y), "point/rect mismatch for {t:?}");
        }
    }

    #[test]
    fn test_transform_region_preserves_coverage() {
        let mut region = Region::new();
        region.add_rect(Rect::new(0, 0, 10, 10));
        region.add_rect(Rect::new(20, 30, 5, 5));
        let out = transform_region(&region, Transform::Rot180, 100, 100);
        assert_eq!(out.len(), 2);
        assert_eq!(out.rects()[0], Rect::new(90, 90, 10, 10));
        assert_eq!(out.rects()[1], Rect::new(75, 65, 5, 5));
    }
}
