//! Pure geometry helpers for world-space reasoning
//!
//! Distance metrics, vector algebra, shape generators and integer snapping.
//! Everything here is deterministic: ordering functions break distance ties
//! lexicographically by `(x, y, z)` so that program behaviour is a function
//! of inputs alone.

use crate::value::Position;

/// Distance metric selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Euclidean,
    Manhattan,
    Chebyshev,
}

pub fn distance(a: &Position, b: &Position, metric: Metric) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    let dz = a.z - b.z;
    match metric {
        Metric::Euclidean => (dx * dx + dy * dy + dz * dz).sqrt(),
        Metric::Manhattan => dx.abs() + dy.abs() + dz.abs(),
        Metric::Chebyshev => dx.abs().max(dy.abs()).max(dz.abs()),
    }
}

/// Sorts positions by distance from `reference`, nearest first. Ties are
/// broken by lexicographic `(x, y, z)` so the order is stable across runs.
pub fn nearest_first(positions: &[Position], reference: &Position, metric: Metric) -> Vec<Position> {
    let mut out: Vec<Position> = positions.to_vec();
    out.sort_by(|a, b| {
        distance(a, reference, metric)
            .total_cmp(&distance(b, reference, metric))
            .then_with(|| a.x.total_cmp(&b.x))
            .then_with(|| a.y.total_cmp(&b.y))
            .then_with(|| a.z.total_cmp(&b.z))
    });
    out
}

pub fn add(a: &Position, b: &Position) -> Position {
    Position::new(a.x + b.x, a.y + b.y, a.z + b.z)
}

pub fn sub(a: &Position, b: &Position) -> Position {
    Position::new(a.x - b.x, a.y - b.y, a.z - b.z)
}

pub fn scale(v: &Position, s: f64) -> Position {
    Position::new(v.x * s, v.y * s, v.z * s)
}

pub fn dot(a: &Position, b: &Position) -> f64 {
    a.x * b.x + a.y * b.y + a.z * b.z
}

pub fn cross(a: &Position, b: &Position) -> Position {
    Position::new(
        a.y * b.z - a.z * b.y,
        a.z * b.x - a.x * b.z,
        a.x * b.y - a.y * b.x,
    )
}

/// Normalizes to unit length. The zero vector normalizes to itself.
pub fn normalize(v: &Position) -> Position {
    let len = dot(v, v).sqrt();
    if len == 0.0 {
        Position::default()
    } else {
        scale(v, 1.0 / len)
    }
}

/// Linear interpolation with `t` clamped to `[0, 1]`.
pub fn lerp(a: &Position, b: &Position, t: f64) -> Position {
    let t = t.clamp(0.0, 1.0);
    add(a, &scale(&sub(b, a), t))
}

/// Projects `a` onto `b`. Projecting onto the zero vector yields zero.
pub fn project(a: &Position, b: &Position) -> Position {
    let denom = dot(b, b);
    if denom == 0.0 {
        Position::default()
    } else {
        scale(b, dot(a, b) / denom)
    }
}

/// Reflects `v` across the plane with unit normal `n`.
pub fn reflect(v: &Position, n: &Position) -> Position {
    sub(v, &scale(n, 2.0 * dot(v, n)))
}

/// Rotates `v` around the Y axis by `angle` radians.
pub fn rotate_y(v: &Position, angle: f64) -> Position {
    let (sin, cos) = angle.sin_cos();
    Position::new(v.x * cos + v.z * sin, v.y, -v.x * sin + v.z * cos)
}

/// Points from `a` to `b` at `step` spacing, including both endpoints.
/// `step` must be positive.
pub fn line(a: &Position, b: &Position, step: f64) -> Vec<Position> {
    let len = a.distance_to(b);
    if len == 0.0 || step <= 0.0 {
        return vec![*a];
    }
    let dir = normalize(&sub(b, a));
    let count = (len / step).floor() as usize;
    let mut out = Vec::with_capacity(count + 2);
    for i in 0..=count {
        out.push(add(a, &scale(&dir, i as f64 * step)));
    }
    if out.last().map(|p| p.distance_to(b)) != Some(0.0) {
        out.push(*b);
    }
    out
}

/// `n` evenly spaced points on the XZ ring of radius `r` around `center`.
pub fn circle(center: &Position, r: f64, n: usize) -> Vec<Position> {
    (0..n)
        .map(|i| {
            let theta = std::f64::consts::TAU * i as f64 / n as f64;
            Position::new(
                center.x + r * theta.cos(),
                center.y,
                center.z + r * theta.sin(),
            )
        })
        .collect()
}

/// A filled disc on the XZ plane: grid points at `spacing` within radius `r`.
pub fn disc(center: &Position, r: f64, spacing: f64) -> Vec<Position> {
    let mut out = Vec::new();
    if spacing <= 0.0 || r < 0.0 {
        return out;
    }
    let steps = (r / spacing).floor() as i64;
    for ix in -steps..=steps {
        for iz in -steps..=steps {
            let dx = ix as f64 * spacing;
            let dz = iz as f64 * spacing;
            if dx * dx + dz * dz <= r * r {
                out.push(center.offset(dx, 0.0, dz));
            }
        }
    }
    out
}

/// Axis-aligned bounding box of a point set, as `(min, max)` corners.
pub fn bounding_box(points: &[Position]) -> Option<(Position, Position)> {
    let first = points.first()?;
    let mut min = *first;
    let mut max = *first;
    for p in &points[1..] {
        min = Position::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
        max = Position::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
    }
    Some((min, max))
}

/// The positions on the square ring at Chebyshev radius `r` around `center`
/// on the XZ plane, in a fixed traversal order: top edge west to east,
/// right edge north to south, bottom edge east to west, left edge south to
/// north. Radius zero yields the center alone.
pub fn square_ring(center: &Position, r: i64) -> Vec<Position> {
    if r <= 0 {
        return vec![*center];
    }
    let mut out = Vec::with_capacity((8 * r) as usize);
    for x in -r..=r {
        out.push(center.offset(x as f64, 0.0, -r as f64));
    }
    for z in (-r + 1)..=r {
        out.push(center.offset(r as f64, 0.0, z as f64));
    }
    for x in (-r..r).rev() {
        out.push(center.offset(x as f64, 0.0, r as f64));
    }
    for z in ((-r + 1)..r).rev() {
        out.push(center.offset(-r as f64, 0.0, z as f64));
    }
    out
}

pub fn round_pos(p: &Position) -> Position {
    Position::new(p.x.round(), p.y.round(), p.z.round())
}

pub fn floor_pos(p: &Position) -> Position {
    Position::new(p.x.floor(), p.y.floor(), p.z.floor())
}

pub fn clamp_scalar(v: f64, lo: f64, hi: f64) -> f64 {
    v.clamp(lo, hi)
}

/// Component-wise clamp of a position between two corner positions.
pub fn clamp_pos(p: &Position, lo: &Position, hi: &Position) -> Position {
    Position::new(
        p.x.clamp(lo.x, hi.x),
        p.y.clamp(lo.y, hi.y),
        p.z.clamp(lo.z, hi.z),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(x: f64, y: f64, z: f64) -> Position {
        Position::new(x, y, z)
    }

    #[test]
    fn metrics_agree_on_axis_moves_and_differ_on_diagonals() {
        let a = pos(0.0, 0.0, 0.0);
        let b = pos(2.0, 3.0, 6.0);
        assert_eq!(distance(&a, &b, Metric::Euclidean), 7.0);
        assert_eq!(distance(&a, &b, Metric::Manhattan), 11.0);
        assert_eq!(distance(&a, &b, Metric::Chebyshev), 6.0);
    }

    #[test]
    fn nearest_first_breaks_ties_lexicographically() {
        let input = [pos(1.0, 0.0, 0.0), pos(0.0, 0.0, 1.0), pos(0.0, 1.0, 0.0)];
        let sorted = nearest_first(&input, &pos(0.0, 0.0, 0.0), Metric::Euclidean);
        assert_eq!(
            sorted,
            vec![pos(0.0, 0.0, 1.0), pos(0.0, 1.0, 0.0), pos(1.0, 0.0, 0.0)]
        );
    }

    #[test]
    fn nearest_first_orders_by_distance_before_tiebreak() {
        let input = [pos(5.0, 0.0, 0.0), pos(0.0, 0.0, 2.0), pos(1.0, 1.0, 1.0)];
        let sorted = nearest_first(&input, &pos(0.0, 0.0, 0.0), Metric::Manhattan);
        assert_eq!(sorted[0], pos(0.0, 0.0, 2.0));
        assert_eq!(sorted[1], pos(1.0, 1.0, 1.0));
        assert_eq!(sorted[2], pos(5.0, 0.0, 0.0));
    }

    #[test]
    fn normalize_zero_is_zero() {
        assert_eq!(normalize(&Position::default()), Position::default());
        let unit = normalize(&pos(0.0, 0.0, 9.0));
        assert_eq!(unit, pos(0.0, 0.0, 1.0));
    }

    #[test]
    fn lerp_clamps_t() {
        let a = pos(0.0, 0.0, 0.0);
        let b = pos(10.0, 0.0, 0.0);
        assert_eq!(lerp(&a, &b, 0.5), pos(5.0, 0.0, 0.0));
        assert_eq!(lerp(&a, &b, 2.0), b);
        assert_eq!(lerp(&a, &b, -1.0), a);
    }

    #[test]
    fn cross_follows_right_hand_rule() {
        let x = pos(1.0, 0.0, 0.0);
        let y = pos(0.0, 1.0, 0.0);
        assert_eq!(cross(&x, &y), pos(0.0, 0.0, 1.0));
    }

    #[test]
    fn line_includes_both_endpoints() {
        let a = pos(0.0, 64.0, 0.0);
        let b = pos(0.0, 64.0, 10.0);
        let points = line(&a, &b, 3.0);
        assert_eq!(points.first(), Some(&a));
        assert_eq!(points.last(), Some(&b));
        assert_eq!(points.len(), 5);

        let exact = line(&a, &b, 5.0);
        assert_eq!(exact.len(), 3);
        assert_eq!(exact.last(), Some(&b));
    }

    #[test]
    fn circle_has_n_points_at_radius() {
        let c = pos(10.0, 64.0, -10.0);
        let ring = circle(&c, 4.0, 8);
        assert_eq!(ring.len(), 8);
        for p in &ring {
            assert!((distance(p, &c, Metric::Euclidean) - 4.0).abs() < 1e-9);
            assert_eq!(p.y, 64.0);
        }
    }

    #[test]
    fn disc_stays_within_radius() {
        let c = Position::default();
        let points = disc(&c, 2.0, 1.0);
        assert!(points.contains(&pos(0.0, 0.0, 0.0)));
        assert!(points.contains(&pos(2.0, 0.0, 0.0)));
        assert!(!points.contains(&pos(2.0, 0.0, 2.0)));
        for p in &points {
            assert!(distance(p, &c, Metric::Euclidean) <= 2.0 + 1e-9);
        }
    }

    #[test]
    fn bounding_box_spans_all_points() {
        let points = [pos(1.0, 5.0, -3.0), pos(-2.0, 0.0, 7.0), pos(0.0, 9.0, 0.0)];
        let (min, max) = bounding_box(&points).unwrap();
        assert_eq!(min, pos(-2.0, 0.0, -3.0));
        assert_eq!(max, pos(1.0, 9.0, 7.0));
        assert!(bounding_box(&[]).is_none());
    }

    #[test]
    fn square_ring_order_and_count() {
        let c = Position::default();
        assert_eq!(square_ring(&c, 0), vec![c]);

        let ring = square_ring(&c, 1);
        assert_eq!(ring.len(), 8);
        // Top edge west to east.
        assert_eq!(ring[0], pos(-1.0, 0.0, -1.0));
        assert_eq!(ring[1], pos(0.0, 0.0, -1.0));
        assert_eq!(ring[2], pos(1.0, 0.0, -1.0));
        // Right edge north to south.
        assert_eq!(ring[3], pos(1.0, 0.0, 0.0));
        assert_eq!(ring[4], pos(1.0, 0.0, 1.0));
        // Bottom edge east to west.
        assert_eq!(ring[5], pos(0.0, 0.0, 1.0));
        assert_eq!(ring[6], pos(-1.0, 0.0, 1.0));
        // Left edge south to north.
        assert_eq!(ring[7], pos(-1.0, 0.0, 0.0));

        assert_eq!(square_ring(&c, 3).len(), 24);
    }

    #[test]
    fn snapping_helpers() {
        let p = pos(1.6, -2.4, 0.5);
        assert_eq!(floor_pos(&p), pos(1.0, -3.0, 0.0));
        assert_eq!(round_pos(&p), pos(2.0, -2.0, 1.0));
        assert_eq!(clamp_scalar(5.0, 0.0, 3.0), 3.0);
        assert_eq!(
            clamp_pos(&p, &pos(0.0, 0.0, 0.0), &pos(1.0, 1.0, 1.0)),
            pos(1.0, 0.0, 0.5)
        );
    }
}
