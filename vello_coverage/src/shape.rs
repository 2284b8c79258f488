// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use peniko::kurbo::{Affine, BezPath, Join, PathEl, Point, Rect, Shape as _, Stroke};
use peniko::{Fill, Style};

/// Fingerprint of a path and the style it is drawn with.
///
/// Two shapes with equal keys produce identical masks under identical transforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShapeKey(pub u64);

/// Whether a shape is filled or stroked. Specs keep separate tallies for each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathKind {
    Fill = 0,
    Stroke = 1,
}

impl PathKind {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Geometry totals for a set of paths, used to size rasterization buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PathStats {
    pub max_points_per_path: u32,
    pub num_total_points: u32,
    pub num_total_verbs: u32,
}

impl PathStats {
    pub fn stat_path(&mut self, shape: &Shape) {
        let (points, verbs) = (shape.num_points(), shape.num_verbs());
        self.max_points_per_path = self.max_points_per_path.max(points);
        self.num_total_points += points;
        self.num_total_verbs += verbs;
    }

    /// Folds `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        self.max_points_per_path = self.max_points_per_path.max(other.max_points_per_path);
        self.num_total_points += other.num_total_points;
        self.num_total_verbs += other.num_total_verbs;
    }
}

/// A path together with its fill or stroke style.
///
/// The path is shared, so cloning a shape is cheap.
#[derive(Clone, Debug)]
pub struct Shape {
    path: Arc<BezPath>,
    style: Style,
    key: ShapeKey,
    bounds: Rect,
    num_points: u32,
}

impl Shape {
    pub fn new(path: impl Into<Arc<BezPath>>, style: impl Into<Style>) -> Self {
        let path = path.into();
        let style = style.into();
        let key = fingerprint(&path, &style);
        let bounds = path.bounding_box();
        let num_points = path
            .elements()
            .iter()
            .map(|el| match el {
                PathEl::MoveTo(_) | PathEl::LineTo(_) => 1,
                PathEl::QuadTo(..) => 2,
                PathEl::CurveTo(..) => 3,
                PathEl::ClosePath => 0,
            })
            .sum();
        Self {
            path,
            style,
            key,
            bounds,
            num_points,
        }
    }

    pub fn fill(path: impl Into<Arc<BezPath>>, fill: Fill) -> Self {
        Self::new(path, fill)
    }

    pub fn stroke(path: impl Into<Arc<BezPath>>, stroke: Stroke) -> Self {
        Self::new(path, stroke)
    }

    pub fn path(&self) -> &BezPath {
        &self.path
    }

    pub fn style(&self) -> &Style {
        &self.style
    }

    pub fn key(&self) -> ShapeKey {
        self.key
    }

    /// Whether both shapes have the same path and style, not merely the same key.
    pub fn same_shape(&self, other: &Self) -> bool {
        self.key == other.key
            && same_style(&self.style, &other.style)
            && (Arc::ptr_eq(&self.path, &other.path)
                || self.path.elements() == other.path.elements())
    }

    /// Replaces the key, to simulate fingerprint collisions.
    #[cfg(test)]
    pub(crate) fn with_key(mut self, key: ShapeKey) -> Self {
        self.key = key;
        self
    }

    pub fn kind(&self) -> PathKind {
        match self.style {
            Style::Fill(_) => PathKind::Fill,
            Style::Stroke(_) => PathKind::Stroke,
        }
    }

    /// Only fills can be even-odd; strokes are always accumulated as nonzero.
    pub fn is_even_odd(&self) -> bool {
        matches!(self.style, Style::Fill(Fill::EvenOdd))
    }

    /// Bounds of the path in local coordinates, ignoring the stroke.
    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn num_points(&self) -> u32 {
        self.num_points
    }

    pub fn num_verbs(&self) -> u32 {
        self.path.elements().len() as u32
    }

    /// Control points of the path.
    pub fn points(&self) -> impl Iterator<Item = Point> + '_ {
        self.path.elements().iter().flat_map(|el| {
            let pts = match *el {
                PathEl::MoveTo(p) | PathEl::LineTo(p) => [Some(p), None, None],
                PathEl::QuadTo(p1, p2) => [Some(p1), Some(p2), None],
                PathEl::CurveTo(p1, p2, p3) => [Some(p1), Some(p2), Some(p3)],
                PathEl::ClosePath => [None; 3],
            };
            pts.into_iter().flatten()
        })
    }

    /// How far the stroke reaches past the path outline, in device pixels.
    pub fn stroke_outset(&self, transform: Affine) -> f64 {
        let Style::Stroke(stroke) = &self.style else {
            return 0.0;
        };
        if stroke.width == 0.0 {
            // Hairlines cover half a pixel on either side regardless of the transform.
            return 0.5;
        }
        let [a, b, c, d, _, _] = transform.as_coeffs();
        // Bounds the largest singular value of the linear part.
        let scale = (a * a + b * b + c * c + d * d).sqrt();
        let join = match stroke.join {
            Join::Miter => stroke.miter_limit.max(1.0),
            _ => 1.0,
        };
        0.5 * stroke.width * join * scale
    }

    /// Conservative bounds of the drawn shape in device space.
    pub fn device_bounds(&self, transform: Affine) -> Rect {
        let outset = self.stroke_outset(transform);
        transform.transform_rect_bbox(self.bounds).inflate(outset, outset)
    }
}

fn same_style(a: &Style, b: &Style) -> bool {
    match (a, b) {
        (Style::Fill(a), Style::Fill(b)) => a == b,
        (Style::Stroke(a), Style::Stroke(b)) => a == b,
        _ => false,
    }
}

fn fingerprint(path: &BezPath, style: &Style) -> ShapeKey {
    let mut hasher = DefaultHasher::new();
    let mut hash_point = |p: &Point| {
        p.x.to_bits().hash(&mut hasher);
        p.y.to_bits().hash(&mut hasher);
    };
    for el in path.elements() {
        match el {
            PathEl::MoveTo(p) => {
                hash_point(p);
            }
            PathEl::LineTo(p) => {
                hash_point(p);
            }
            PathEl::QuadTo(p1, p2) => {
                hash_point(p1);
                hash_point(p2);
            }
            PathEl::CurveTo(p1, p2, p3) => {
                hash_point(p1);
                hash_point(p2);
                hash_point(p3);
            }
            PathEl::ClosePath => {}
        }
    }
    // Verbs are hashed separately so that e.g. a line and a degenerate quad differ.
    for el in path.elements() {
        let verb: u8 = match el {
            PathEl::MoveTo(_) => 0,
            PathEl::LineTo(_) => 1,
            PathEl::QuadTo(..) => 2,
            PathEl::CurveTo(..) => 3,
            PathEl::ClosePath => 4,
        };
        verb.hash(&mut hasher);
    }
    match style {
        Style::Fill(fill) => {
            0_u8.hash(&mut hasher);
            matches!(fill, Fill::EvenOdd).hash(&mut hasher);
        }
        Style::Stroke(stroke) => {
            1_u8.hash(&mut hasher);
            stroke.width.to_bits().hash(&mut hasher);
            stroke.miter_limit.to_bits().hash(&mut hasher);
            (stroke.join as u8).hash(&mut hasher);
            (stroke.start_cap as u8).hash(&mut hasher);
            (stroke.end_cap as u8).hash(&mut hasher);
            stroke.dash_offset.to_bits().hash(&mut hasher);
            for dash in stroke.dash_pattern.iter() {
                dash.to_bits().hash(&mut hasher);
            }
        }
    }
    ShapeKey(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use peniko::kurbo::{Circle, Shape as _};

    fn square(size: f64) -> BezPath {
        Rect::new(0.0, 0.0, size, size).to_path(0.1)
    }

    #[test]
    fn equal_paths_share_a_key() {
        let a = Shape::fill(square(10.0), Fill::NonZero);
        let b = Shape::fill(square(10.0), Fill::NonZero);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), Shape::fill(square(11.0), Fill::NonZero).key());
        assert_ne!(a.key(), Shape::fill(square(10.0), Fill::EvenOdd).key());
        assert_ne!(a.key(), Shape::stroke(square(10.0), Stroke::new(2.0)).key());
    }

    #[test]
    fn same_shape_looks_past_the_key() {
        let a = Shape::fill(square(10.0), Fill::NonZero);
        assert!(a.same_shape(&a.clone()));
        assert!(a.same_shape(&Shape::fill(square(10.0), Fill::NonZero)));
        let forged = Shape::fill(square(11.0), Fill::NonZero).with_key(a.key());
        assert!(!a.same_shape(&forged));
        let even_odd = Shape::fill(square(10.0), Fill::EvenOdd).with_key(a.key());
        assert!(!a.same_shape(&even_odd));
    }

    #[test]
    fn stroke_inflates_device_bounds() {
        let fill = Shape::fill(square(10.0), Fill::NonZero);
        let stroke = Shape::stroke(square(10.0), Stroke::new(4.0).with_join(Join::Round));
        let transform = Affine::translate((5.0, 5.0));
        assert_eq!(fill.device_bounds(transform), Rect::new(5.0, 5.0, 15.0, 15.0));
        let outset = stroke.stroke_outset(transform);
        assert!(outset >= 2.0);
        assert_eq!(
            stroke.device_bounds(transform),
            Rect::new(5.0, 5.0, 15.0, 15.0).inflate(outset, outset)
        );
    }

    #[test]
    fn stats_count_control_points() {
        let circle = Shape::fill(Circle::new((0.0, 0.0), 10.0).to_path(0.1), Fill::NonZero);
        let mut stats = PathStats::default();
        stats.stat_path(&circle);
        stats.stat_path(&Shape::fill(square(1.0), Fill::NonZero));
        assert_eq!(stats.max_points_per_path, circle.num_points());
        assert_eq!(stats.num_total_points, circle.num_points() + 4);
        assert_eq!(circle.points().count() as u32, circle.num_points());
    }
}
