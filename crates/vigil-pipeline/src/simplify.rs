//! Polygon simplification using the Ramer-Douglas-Peucker algorithm.
//!
//! Reduces the vertex count of blob contours by removing points that are
//! within a given tolerance of the line between their neighbors, plus a
//! stride-based down-sampler that caps the vertex count outright.
//!
//! Blob contours are closed, so [`simplify_closed`] splits the ring at the
//! vertex farthest from the first one and simplifies both halves as open
//! polylines.

use crate::types::{PixelPoint, Point, Polyline};

/// Simplify a single open polyline using the Ramer-Douglas-Peucker algorithm.
///
/// Points within `tolerance` pixels of the line between their endpoints
/// are removed. A tolerance of 0.0 preserves all points.
///
/// Polylines with fewer than 3 points are returned unchanged.
#[must_use = "returns the simplified polyline"]
pub fn simplify(polyline: &Polyline, tolerance: f64) -> Polyline {
    let points = polyline.points();
    if points.len() < 3 {
        return polyline.clone();
    }

    let mut kept = vec![false; points.len()];
    kept[0] = true;
    kept[points.len() - 1] = true;

    rdp_recurse(points, 0, points.len() - 1, tolerance, &mut kept);

    let simplified: Vec<Point> = points
        .iter()
        .zip(&kept)
        .filter(|&(_, k)| *k)
        .map(|(&p, _)| p)
        .collect();

    Polyline::new(simplified)
}

/// Simplify a closed integer polygon (first point not repeated).
///
/// The result is also implicitly closed. Polygons with fewer than 4
/// vertices are returned unchanged.
#[must_use = "returns the simplified polygon"]
#[allow(clippy::cast_possible_truncation)]
pub fn simplify_closed(polygon: &[PixelPoint], tolerance: f64) -> Vec<PixelPoint> {
    if polygon.len() < 4 {
        return polygon.to_vec();
    }

    let origin = to_point(polygon[0]);
    let split = polygon
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            origin
                .distance_squared(to_point(**a))
                .total_cmp(&origin.distance_squared(to_point(**b)))
        })
        .map_or(0, |(i, _)| i);
    if split == 0 {
        return vec![polygon[0]];
    }

    let first: Vec<Point> = polygon[..=split].iter().copied().map(to_point).collect();
    let second: Vec<Point> = polygon[split..]
        .iter()
        .chain(std::iter::once(&polygon[0]))
        .copied()
        .map(to_point)
        .collect();

    let first = simplify(&Polyline::new(first), tolerance).into_points();
    let second = simplify(&Polyline::new(second), tolerance).into_points();

    // The split vertex is shared and the origin is repeated at the end.
    let mut ring: Vec<PixelPoint> = first
        .into_iter()
        .chain(second.into_iter().skip(1))
        .map(|p| PixelPoint::new(p.x.round() as i32, p.y.round() as i32))
        .collect();
    ring.pop();
    ring
}

/// Total edge length of a closed polygon, including the closing edge.
#[must_use]
pub fn perimeter_closed(polygon: &[PixelPoint]) -> f64 {
    if polygon.len() < 2 {
        return 0.0;
    }
    polygon
        .iter()
        .zip(polygon.iter().cycle().skip(1))
        .map(|(&a, &b)| to_point(a).distance(to_point(b)))
        .sum()
}

/// Keep every `ceil(len / max_points)`-th vertex so at most `max_points`
/// remain. `max_points == 0` disables the cap.
#[must_use = "returns the down-sampled polygon"]
pub fn downsample(polygon: &[PixelPoint], max_points: usize) -> Vec<PixelPoint> {
    if max_points == 0 || polygon.len() <= max_points {
        return polygon.to_vec();
    }
    let stride = polygon.len().div_ceil(max_points);
    polygon.iter().step_by(stride).copied().collect()
}

/// Append the first vertex if the polygon does not already end on it.
#[must_use = "returns the closed polygon"]
pub fn close_ring(mut polygon: Vec<PixelPoint>) -> Vec<PixelPoint> {
    if let (Some(&first), Some(&last)) = (polygon.first(), polygon.last())
        && (polygon.len() == 1 || first != last)
    {
        polygon.push(first);
    }
    polygon
}

fn to_point(p: PixelPoint) -> Point {
    Point::new(f64::from(p.x), f64::from(p.y))
}

/// Recursive step of the Ramer-Douglas-Peucker algorithm.
///
/// Finds the point between `start` and `end` that is farthest from the
/// line segment between them. If that distance exceeds `tolerance`, the
/// point is kept and both sub-segments are processed recursively.
fn rdp_recurse(points: &[Point], start: usize, end: usize, tolerance: f64, kept: &mut [bool]) {
    if end <= start + 1 {
        return;
    }

    let mut max_dist = 0.0;
    let mut max_idx = start;

    for i in (start + 1)..end {
        let d = perpendicular_distance(points[i], points[start], points[end]);
        if d > max_dist {
            max_dist = d;
            max_idx = i;
        }
    }

    if max_dist > tolerance {
        kept[max_idx] = true;
        rdp_recurse(points, start, max_idx, tolerance, kept);
        rdp_recurse(points, max_idx, end, tolerance, kept);
    }
}

/// Perpendicular distance from point `p` to the line defined by `a` and `b`.
///
/// When `a` and `b` coincide, returns the distance from `p` to `a`.
fn perpendicular_distance(p: Point, a: Point, b: Point) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let length_sq = dx.mul_add(dx, dy * dy);

    if length_sq == 0.0 {
        return p.distance(a);
    }

    let cross = dx.mul_add(a.y - p.y, -(dy * (a.x - p.x)));
    cross.abs() / length_sq.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn px(x: i32, y: i32) -> PixelPoint {
        PixelPoint::new(x, y)
    }

    #[test]
    fn two_points_unchanged() {
        let pl = Polyline::new(vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)]);
        assert_eq!(simplify(&pl, 1.0).len(), 2);
    }

    #[test]
    fn collinear_points_collapse_to_endpoints() {
        let pl = Polyline::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(2.0, 2.0),
            Point::new(3.0, 3.0),
            Point::new(4.0, 4.0),
        ]);
        let result = simplify(&pl, 0.1);
        assert_eq!(result.points(), &[Point::new(0.0, 0.0), Point::new(4.0, 4.0)]);
    }

    #[test]
    fn zigzag_retains_peaks() {
        let pl = Polyline::new(vec![
            Point::new(0.0, 0.0),
            Point::new(2.0, 5.0),
            Point::new(4.0, 0.0),
            Point::new(6.0, 5.0),
            Point::new(8.0, 0.0),
        ]);
        assert_eq!(simplify(&pl, 1.0).len(), 5);
        assert_eq!(simplify(&pl, 10.0).len(), 2);
    }

    #[test]
    fn closed_square_with_edge_midpoints_reduces_to_corners() {
        let ring = vec![
            px(0, 0),
            px(5, 0),
            px(10, 0),
            px(10, 5),
            px(10, 10),
            px(5, 10),
            px(0, 10),
            px(0, 5),
        ];
        let out = simplify_closed(&ring, 0.5);
        assert_eq!(out, vec![px(0, 0), px(10, 0), px(10, 10), px(0, 10)]);
    }

    #[test]
    fn closed_triangle_unchanged() {
        let ring = vec![px(0, 0), px(4, 0), px(0, 4)];
        assert_eq!(simplify_closed(&ring, 100.0), ring);
    }

    #[test]
    fn perimeter_includes_closing_edge() {
        let square = [px(0, 0), px(3, 0), px(3, 3), px(0, 3)];
        assert!((perimeter_closed(&square) - 12.0).abs() < 1e-9);
        assert!(perimeter_closed(&square[..1]).abs() < f64::EPSILON);
    }

    #[test]
    fn downsample_uses_ceiling_stride() {
        let ring: Vec<PixelPoint> = (0..10).map(|i| px(i, 0)).collect();
        let out = downsample(&ring, 4);
        // stride = ceil(10 / 4) = 3
        assert_eq!(out, vec![px(0, 0), px(3, 0), px(6, 0), px(9, 0)]);
        assert_eq!(downsample(&ring, 0).len(), 10);
        assert_eq!(downsample(&ring, 20).len(), 10);
    }

    #[test]
    fn close_ring_appends_first_point_once() {
        let closed = close_ring(vec![px(0, 0), px(1, 0), px(1, 1)]);
        assert_eq!(closed.last(), Some(&px(0, 0)));
        assert_eq!(close_ring(closed.clone()), closed);
        assert!(close_ring(Vec::new()).is_empty());
    }
}
