//! Convex hull and polygon area over the shared point set.
//!
//! Both functions are pure: they never touch the graph lock themselves, the
//! caller hands them a slice it already holds.

use std::fmt;

/// Tolerance used when matching points for removal.
pub const POINT_EPSILON: f64 = 1e-9;

/// A point in the plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Coordinate-wise equality within [`POINT_EPSILON`].
    pub fn approx_eq(&self, other: &Point) -> bool {
        (self.x - other.x).abs() < POINT_EPSILON && (self.y - other.y).abs() < POINT_EPSILON
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Z component of `(a - o) x (b - o)`. Positive when `o -> a -> b` turns left.
fn cross(o: &Point, a: &Point, b: &Point) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Monotone chain hull. Returns the vertices in counter-clockwise order
/// starting from the lowest (then leftmost) point.
///
/// Points are ordered lexicographically with `total_cmp`, so nearly
/// colinear input still sorts under a total order; the cross product is
/// only used to decide which points to pop. Interior and colinear points
/// are dropped. Inputs with fewer than three points are returned unchanged.
pub fn convex_hull(points: &[Point]) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));

    let mut hull: Vec<Point> = Vec::with_capacity(sorted.len() + 1);

    for p in &sorted {
        while hull.len() >= 2 && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(*p);
    }

    // The upper chain never pops into the lower one.
    let lower_len = hull.len() + 1;
    for p in sorted.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(*p);
    }
    // Closing point repeats the first.
    hull.pop();

    let start = hull
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)))
        .map(|(i, _)| i)
        .unwrap_or(0);
    hull.rotate_left(start);

    hull
}

/// Shoelace area of a polygon. Zero for fewer than three vertices.
pub fn polygon_area(boundary: &[Point]) -> f64 {
    if boundary.len() < 3 {
        return 0.0;
    }

    let twice: f64 = boundary
        .iter()
        .zip(boundary.iter().cycle().skip(1))
        .map(|(a, b)| a.x * b.y - b.x * a.y)
        .sum();

    twice.abs() / 2.0
}

/// Convenience: area of the convex hull of `points`.
pub fn hull_area(points: &[Point]) -> f64 {
    polygon_area(&convex_hull(points))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_with_center() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(5.0, 5.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ]
    }

    #[test]
    fn hull_drops_interior_point() {
        let hull = convex_hull(&square_with_center());

        assert_eq!(
            hull,
            vec![
                Point::new(0.0, 0.0),
                Point::new(10.0, 0.0),
                Point::new(10.0, 10.0),
                Point::new(0.0, 10.0),
            ]
        );
        assert_eq!(polygon_area(&hull), 100.0);
    }

    #[test]
    fn hull_is_counter_clockwise() {
        let hull = convex_hull(&square_with_center());
        let signed: f64 = hull
            .iter()
            .zip(hull.iter().cycle().skip(1))
            .map(|(a, b)| a.x * b.y - b.x * a.y)
            .sum();
        assert!(signed > 0.0);
    }

    #[test]
    fn hull_drops_colinear_edge_points() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(2.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(4.0, 4.0),
            Point::new(0.0, 4.0),
            Point::new(0.0, 2.0),
        ];
        let hull = convex_hull(&points);

        assert_eq!(hull.len(), 4);
        assert!(!hull.contains(&Point::new(2.0, 0.0)));
        assert!(!hull.contains(&Point::new(0.0, 2.0)));
        assert_eq!(polygon_area(&hull), 16.0);
    }

    #[test]
    fn all_colinear_points_have_zero_area() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(2.0, 2.0),
            Point::new(3.0, 3.0),
        ];
        assert_eq!(hull_area(&points), 0.0);
    }

    #[test]
    fn duplicates_do_not_change_the_hull() {
        let mut points = square_with_center();
        points.push(Point::new(0.0, 0.0));
        points.push(Point::new(10.0, 10.0));

        assert_eq!(convex_hull(&points).len(), 4);
        assert_eq!(hull_area(&points), 100.0);
    }

    #[test]
    fn degenerate_inputs() {
        assert!(convex_hull(&[]).is_empty());
        assert_eq!(hull_area(&[]), 0.0);

        let one = [Point::new(3.0, 4.0)];
        assert_eq!(convex_hull(&one), one.to_vec());
        assert_eq!(hull_area(&one), 0.0);

        let two = [Point::new(0.0, 0.0), Point::new(5.0, 5.0)];
        assert_eq!(convex_hull(&two), two.to_vec());
        assert_eq!(hull_area(&two), 0.0);
    }

    #[test]
    fn triangle_area() {
        let tri = [
            Point::new(0.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(0.0, 3.0),
        ];
        assert_eq!(hull_area(&tri), 6.0);
    }

    /// xorshift64, enough to scatter test points deterministically.
    fn next_unit(state: &mut u64) -> f64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        (*state >> 11) as f64 / (1u64 << 53) as f64
    }

    #[test]
    fn nearly_colinear_points_do_not_break_sorting() {
        let mut state = 0x9e37_79b9_7f4a_7c15;

        for _ in 0..3000 {
            let n = 20 + (next_unit(&mut state) * 200.0) as usize;
            let points: Vec<Point> = (0..n)
                .map(|_| {
                    let x = next_unit(&mut state) * 1e6;
                    let jitter = (next_unit(&mut state) * 2.0 - 1.0) * 1e-9;
                    Point::new(x, 0.3 * x + jitter)
                })
                .collect();

            let hull = convex_hull(&points);
            assert!(hull.len() >= 2);
            assert!(hull.iter().all(|h| points.contains(h)));

            let area = polygon_area(&hull);
            assert!(area.is_finite() && area >= 0.0);
            assert!(area < 1.0, "sliver hull has area {area}");
        }
    }

    #[test]
    fn hull_starts_at_lowest_point() {
        let points = [
            Point::new(10.0, 0.0),
            Point::new(-3.0, 4.0),
            Point::new(2.0, -6.0),
            Point::new(8.0, 7.0),
            Point::new(1.0, 1.0),
        ];
        let hull = convex_hull(&points);

        assert_eq!(hull[0], Point::new(2.0, -6.0));
        assert_eq!(hull.len(), 4);
        assert_eq!(polygon_area(&hull), hull_area(&points));
    }

    #[test]
    fn approx_eq_uses_epsilon() {
        let p = Point::new(1.0, 2.0);
        assert!(p.approx_eq(&Point::new(1.0 + 1e-12, 2.0 - 1e-12)));
        assert!(!p.approx_eq(&Point::new(1.0 + 1e-6, 2.0)));
    }
}
