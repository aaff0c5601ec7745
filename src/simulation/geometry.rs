//! Geometry primitives for positions, distances and line-of-sight tests.
//!
//! Contains helper functions for:
//! - Euclidean and wrap-around (toroidal) distances
//! - Point-in-shape tests (rectangles, circles)
//! - Segment-shape intersection tests, including 3D rectangular facets
//! - Segment-segment intersection with collinear handling

use serde::{Deserialize, Serialize};

/// Tolerance used when a segment runs parallel to a facet plane.
const PLANE_EPSILON: f64 = 1e-12;

/// Position in world coordinates. `z` defaults to 0 for planar scenes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: 0.0 }
    }

    pub const fn new_3d(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Squared Euclidean distance (avoids a sqrt when only comparing).
    pub fn distance2(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    pub fn distance(&self, other: &Point) -> f64 {
        self.distance2(other).sqrt()
    }

    pub fn translate(&self, dx: f64, dy: f64) -> Point {
        Point::new_3d(self.x + dx, self.y + dy, self.z)
    }

    /// Planar heading (radians) from `self` towards `target`.
    pub fn angle_to(&self, target: &Point) -> f64 {
        (target.y - self.y).atan2(target.x - self.x)
    }

    fn sub(&self, other: &Point) -> Point {
        Point::new_3d(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    fn dot(&self, other: &Point) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    fn cross(&self, other: &Point) -> Point {
        Point::new_3d(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }
}

/// Distance on a `width x height` torus: each planar axis takes the shorter of
/// the direct and the wrapped separation. Never exceeds the Euclidean distance.
pub fn toroidal_distance(a: &Point, b: &Point, width: f64, height: f64) -> f64 {
    let dx = wrapped_axis_delta(a.x - b.x, width);
    let dy = wrapped_axis_delta(a.y - b.y, height);
    let dz = a.z - b.z;
    (dx * dx + dy * dy + dz * dz).sqrt()
}

fn wrapped_axis_delta(delta: f64, extent: f64) -> f64 {
    let direct = delta.abs() % extent;
    direct.min(extent - direct)
}

/// Normalize a position into `[0, width) x [0, height)`.
pub fn wrap(p: &Point, width: f64, height: f64) -> Point {
    Point::new_3d(wrap_axis(p.x, width), wrap_axis(p.y, height), p.z)
}

fn wrap_axis(value: f64, extent: f64) -> f64 {
    let wrapped = value.rem_euclid(extent);
    // rem_euclid can round up to `extent` for tiny negative inputs
    if wrapped >= extent { 0.0 } else { wrapped }
}

/// Inclusive point-in-rectangle test on the plane. Corners may be given in any order.
pub fn point_in_rect(p: &Point, corner_a: &Point, corner_b: &Point) -> bool {
    let (left, right, top, bottom) = rect_bounds(corner_a, corner_b);
    p.x >= left && p.x <= right && p.y >= top && p.y <= bottom
}

/// Inclusive point-inside-circle test on the plane.
pub fn point_in_circle(p: &Point, center: &Point, radius: f64) -> bool {
    let dx = p.x - center.x;
    let dy = p.y - center.y;
    dx * dx + dy * dy <= radius * radius
}

/// Normalize rectangle corners to (left,right,top,bottom) tuple.
fn rect_bounds(a: &Point, b: &Point) -> (f64, f64, f64, f64) {
    (a.x.min(b.x), a.x.max(b.x), a.y.min(b.y), a.y.max(b.y))
}

/// Segment vs. axis-aligned rectangle intersection test.
pub fn segment_intersects_rect(p1: &Point, p2: &Point, corner_a: &Point, corner_b: &Point) -> bool {
    if point_in_rect(p1, corner_a, corner_b) || point_in_rect(p2, corner_a, corner_b) {
        return true;
    }

    let (left, right, top, bottom) = rect_bounds(corner_a, corner_b);
    let lt = Point::new(left, top);
    let rt = Point::new(right, top);
    let rb = Point::new(right, bottom);
    let lb = Point::new(left, bottom);

    segments_intersect(p1, p2, &lt, &rt) || segments_intersect(p1, p2, &rt, &rb) || segments_intersect(p1, p2, &rb, &lb) || segments_intersect(p1, p2, &lb, &lt)
}

/// Squared planar distance from `c` to the closest point of segment `p1`–`p2`,
/// using projection with a clamped parameter t.
pub fn segment_point_distance2(p1: &Point, p2: &Point, c: &Point) -> f64 {
    let dx = p2.x - p1.x;
    let dy = p2.y - p1.y;
    if dx == 0.0 && dy == 0.0 {
        let ddx = p1.x - c.x;
        let ddy = p1.y - c.y;
        return ddx * ddx + ddy * ddy;
    }
    let t = ((c.x - p1.x) * dx + (c.y - p1.y) * dy) / (dx * dx + dy * dy);
    let t_clamped = t.clamp(0.0, 1.0);
    let closest_x = p1.x + t_clamped * dx;
    let closest_y = p1.y + t_clamped * dy;
    let ddx = closest_x - c.x;
    let ddy = closest_y - c.y;
    ddx * ddx + ddy * ddy
}

/// Segment vs. circle: blocked when the circle center lies within `radius` of the segment.
pub fn segment_intersects_circle(p1: &Point, p2: &Point, center: &Point, radius: f64) -> bool {
    segment_point_distance2(p1, p2, center) <= radius * radius
}

/// Segment vs. rectangular facet spanned by `origin + a*edge_u + b*edge_v`
/// with `a, b` in `[0, 1]`.
///
/// The segment is intersected with the facet plane, then the hit point is
/// expressed in the facet's edge basis and checked against its bounds. A
/// segment parallel to the plane never intersects (a coplanar segment grazes
/// a zero-thickness wall).
pub fn segment_intersects_facet(p1: &Point, p2: &Point, origin: &Point, edge_u: &Point, edge_v: &Point) -> bool {
    let normal = edge_u.cross(edge_v);
    let direction = p2.sub(p1);
    let denom = normal.dot(&direction);
    if denom.abs() < PLANE_EPSILON {
        return false;
    }

    let t = normal.dot(&origin.sub(p1)) / denom;
    if !(0.0..=1.0).contains(&t) {
        return false;
    }

    let hit = Point::new_3d(p1.x + t * direction.x, p1.y + t * direction.y, p1.z + t * direction.z);
    let w = hit.sub(origin);
    let uu = edge_u.dot(edge_u);
    let vv = edge_v.dot(edge_v);
    let uv = edge_u.dot(edge_v);
    let wu = w.dot(edge_u);
    let wv = w.dot(edge_v);
    let det = uu * vv - uv * uv;
    if det.abs() < PLANE_EPSILON {
        return false;
    }
    let a = (vv * wu - uv * wv) / det;
    let b = (uu * wv - uv * wu) / det;
    (0.0..=1.0).contains(&a) && (0.0..=1.0).contains(&b)
}

/// Area measure of the parallelogram spanned by two edges; zero means degenerate.
pub(crate) fn parallelogram_area(edge_u: &Point, edge_v: &Point) -> f64 {
    let n = edge_u.cross(edge_v);
    n.dot(&n).sqrt()
}

/// Orientation of ordered triplet (a,b,c): returns 1 if clockwise, -1 if
/// counter-clockwise, and 0 if collinear.
fn orientation(a: &Point, b: &Point, c: &Point) -> i32 {
    let val = (b.y - a.y) * (c.x - b.x) - (b.x - a.x) * (c.y - b.y);
    if val > 0.0 {
        1
    } else if val < 0.0 {
        -1
    } else {
        0
    }
}

/// True if point b lies on segment a–c, assuming collinearity.
fn on_segment(a: &Point, b: &Point, c: &Point) -> bool {
    b.x >= a.x.min(c.x) && b.x <= a.x.max(c.x) && b.y >= a.y.min(c.y) && b.y <= a.y.max(c.y)
}

/// Planar segment–segment intersection including collinear overlap and
/// endpoint touching.
pub fn segments_intersect(p1: &Point, q1: &Point, p2: &Point, q2: &Point) -> bool {
    let o1 = orientation(p1, q1, p2);
    let o2 = orientation(p1, q1, q2);
    let o3 = orientation(p2, q2, p1);
    let o4 = orientation(p2, q2, q1);

    if o1 != o2 && o3 != o4 {
        return true;
    }
    (o1 == 0 && on_segment(p1, p2, q1)) || (o2 == 0 && on_segment(p1, q2, q1)) || (o3 == 0 && on_segment(p2, p1, q2)) || (o4 == 0 && on_segment(p2, q1, q2))
}
