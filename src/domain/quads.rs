//! Quad construction and geometric hash codes.
//!
//! Four stars A, B, C, D form a code by mapping the plane so A lands on
//! (0,0) and B on (1,1); the coordinates of C and D in that frame are the
//! 4-D code. The code is invariant under translation, rotation and scale.
//! Canonical form: A/B are swapped so `cx + dx <= 1` and C/D so
//! `cx <= dx`; C and D must fall strictly inside the circle with AB as
//! diameter, otherwise the quad is rejected.

/// A quad built over the field star list.
#[derive(Debug, Clone)]
pub struct FieldQuad {
    /// Indices into the field star list, in canonical A, B, C, D order.
    pub stars: [usize; 4],
    pub code: [f64; 4],
    /// Backbone length |AB|, in the source units (pixels for field quads).
    pub scale: f64,
}

/// Map `p` into the frame where `a` is (0,0) and `b` is (1,1).
fn frame_coords(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> (f64, f64) {
    let bx = b.0 - a.0;
    let by = b.1 - a.1;
    let inv_scale = 1.0 / (bx * bx + by * by);
    let cos_t = (bx + by) * inv_scale;
    let sin_t = (by - bx) * inv_scale;
    let px = p.0 - a.0;
    let py = p.1 - a.1;
    (px * cos_t + py * sin_t, -px * sin_t + py * cos_t)
}

#[inline]
fn inside_unit_circle(x: f64, y: f64) -> bool {
    // Circle with AB as diameter: center (0.5, 0.5), radius^2 = 0.5.
    // Strict comparison; boundary points are rejected.
    let dx = x - 0.5;
    let dy = y - 0.5;
    dx * dx + dy * dy < 0.5
}

/// Compute the canonical code for four positions given as
/// (A, B, C, D) candidates. Returns the code and the permutation of the
/// input indices in canonical order, or None when C or D leaves the
/// circle.
pub fn quad_code(pts: [(f64, f64); 4]) -> Option<([f64; 4], [usize; 4])> {
    let mut order = [0usize, 1, 2, 3];
    let (mut cx, mut cy) = frame_coords(pts[0], pts[1], pts[2]);
    let (mut dx, mut dy) = frame_coords(pts[0], pts[1], pts[3]);

    if cx + dx > 1.0 {
        // Swapping A and B maps (x, y) to (1-x, 1-y).
        order.swap(0, 1);
        (cx, cy) = (1.0 - cx, 1.0 - cy);
        (dx, dy) = (1.0 - dx, 1.0 - dy);
    }
    if cx > dx {
        order.swap(2, 3);
        std::mem::swap(&mut cx, &mut dx);
        std::mem::swap(&mut cy, &mut dy);
    }
    if !inside_unit_circle(cx, cy) || !inside_unit_circle(dx, dy) {
        return None;
    }
    Some(([cx, cy, dx, dy], order))
}

/// Mirror a code to the opposite parity: reflection swaps each star's
/// frame coordinates, then the result is put back in canonical form.
/// The returned permutation maps each canonical position of the flipped
/// code to the position of the same star in the input code.
pub fn flip_code_perm(code: &[f64; 4]) -> ([f64; 4], [usize; 4]) {
    let (mut cx, mut cy, mut dx, mut dy) = (code[1], code[0], code[3], code[2]);
    let mut perm = [0usize, 1, 2, 3];
    if cx + dx > 1.0 {
        (cx, cy) = (1.0 - cx, 1.0 - cy);
        (dx, dy) = (1.0 - dx, 1.0 - dy);
        perm.swap(0, 1);
    }
    if cx > dx {
        std::mem::swap(&mut cx, &mut dx);
        std::mem::swap(&mut cy, &mut dy);
        perm.swap(2, 3);
    }
    ([cx, cy, dx, dy], perm)
}

pub fn flip_code(code: &[f64; 4]) -> [f64; 4] {
    flip_code_perm(code).0
}

/// Build the canonical quad for four stars of `positions`, choosing the
/// most distant pair as the backbone. Returns None when the backbone
/// length is outside `[min_ab, max_ab]` or the circle test fails.
pub fn build_quad(
    positions: &[(f64, f64)],
    ids: [usize; 4],
    min_ab: f64,
    max_ab: f64,
) -> Option<FieldQuad> {
    let mut best = (0usize, 1usize, 0.0f64);
    for i in 0..4 {
        for j in i + 1..4 {
            let p = positions[ids[i]];
            let q = positions[ids[j]];
            let d2 = (p.0 - q.0).powi(2) + (p.1 - q.1).powi(2);
            if d2 > best.2 {
                best = (i, j, d2);
            }
        }
    }
    let scale = best.2.sqrt();
    if scale < min_ab || scale > max_ab {
        return None;
    }

    let (ai, bi) = (best.0, best.1);
    let rest: Vec<usize> = (0..4).filter(|&k| k != ai && k != bi).collect();
    let arranged = [ids[ai], ids[bi], ids[rest[0]], ids[rest[1]]];
    let pts = [
        positions[arranged[0]],
        positions[arranged[1]],
        positions[arranged[2]],
        positions[arranged[3]],
    ];
    let (code, perm) = quad_code(pts)?;
    Some(FieldQuad {
        stars: [
            arranged[perm[0]],
            arranged[perm[1]],
            arranged[perm[2]],
            arranged[perm[3]],
        ],
        code,
        scale,
    })
}

/// Combination count between `keep_going` polls.
const CHECK_EVERY: u32 = 1024;

/// Enumerate canonical quads whose newest star index lies in
/// `depth_lo..depth_hi` (0-based, exclusive), calling `emit` for each.
/// `emit` returns false to stop the enumeration early; `keep_going` is
/// polled periodically even while nothing is emitted, so a stale worker
/// stays responsive to cancellation.
pub fn enumerate_quads(
    positions: &[(f64, f64)],
    depth_lo: usize,
    depth_hi: usize,
    min_ab: f64,
    max_ab: f64,
    keep_going: &mut impl FnMut() -> bool,
    emit: &mut impl FnMut(FieldQuad) -> bool,
) {
    let n = positions.len();
    let hi = depth_hi.min(n);
    let mut combos = 0u32;
    // The newest star bounds the quad: every quad is enumerated exactly
    // once, at the depth of its highest-index member.
    for newest in depth_lo.max(3)..hi {
        for i in 0..newest {
            for j in i + 1..newest {
                for k in j + 1..newest {
                    combos += 1;
                    if combos >= CHECK_EVERY {
                        combos = 0;
                        if !keep_going() {
                            return;
                        }
                    }
                    if let Some(quad) =
                        build_quad(positions, [i, j, k, newest], min_ab, max_ab)
                    {
                        if !emit(quad) {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_positions() -> Vec<(f64, f64)> {
        vec![(10.0, 10.0), (110.0, 110.0), (52.0, 61.0), (71.0, 48.0)]
    }

    #[test]
    fn test_code_invariants() {
        let quad = build_quad(&sample_positions(), [0, 1, 2, 3], 0.0, f64::MAX).unwrap();
        let code = quad.code;
        assert!(code[0] <= code[2]);
        assert!(code[0] + code[2] <= 1.0);
        for &c in &code {
            assert!((-0.3..=1.3).contains(&c), "code component {}", c);
        }
    }

    #[test]
    fn test_code_invariant_under_similarity() {
        let base = sample_positions();
        let quad1 = build_quad(&base, [0, 1, 2, 3], 0.0, f64::MAX).unwrap();

        // Rotate by 73 degrees, scale by 2.7, translate.
        let theta = 73.0f64.to_radians();
        let (s, c) = theta.sin_cos();
        let moved: Vec<(f64, f64)> = base
            .iter()
            .map(|&(x, y)| {
                (
                    2.7 * (c * x - s * y) + 400.0,
                    2.7 * (s * x + c * y) - 120.0,
                )
            })
            .collect();
        let quad2 = build_quad(&moved, [0, 1, 2, 3], 0.0, f64::MAX).unwrap();

        for i in 0..4 {
            assert!(
                (quad1.code[i] - quad2.code[i]).abs() < 1e-9,
                "component {} differs: {} vs {}",
                i,
                quad1.code[i],
                quad2.code[i]
            );
        }
    }

    #[test]
    fn test_flip_code_roundtrip() {
        let quad = build_quad(&sample_positions(), [0, 1, 2, 3], 0.0, f64::MAX).unwrap();
        let flipped = flip_code(&quad.code);
        assert_eq!(flip_code(&flipped), quad.code);
    }

    #[test]
    fn test_mirrored_field_matches_flip() {
        let base = sample_positions();
        let quad1 = build_quad(&base, [0, 1, 2, 3], 0.0, f64::MAX).unwrap();
        let mirrored: Vec<(f64, f64)> = base.iter().map(|&(x, y)| (x, -y)).collect();
        let quad2 = build_quad(&mirrored, [0, 1, 2, 3], 0.0, f64::MAX).unwrap();

        let flipped = flip_code(&quad1.code);
        for i in 0..4 {
            assert!(
                (quad2.code[i] - flipped[i]).abs() < 1e-9,
                "component {} differs: {} vs {}",
                i,
                quad2.code[i],
                flipped[i]
            );
        }
    }

    #[test]
    fn test_scale_band_rejects() {
        let positions = sample_positions();
        // |AB| is about 141.4.
        assert!(build_quad(&positions, [0, 1, 2, 3], 150.0, 500.0).is_none());
        assert!(build_quad(&positions, [0, 1, 2, 3], 10.0, 100.0).is_none());
        assert!(build_quad(&positions, [0, 1, 2, 3], 100.0, 150.0).is_some());
    }

    #[test]
    fn test_outside_circle_rejected() {
        // C far off the AB axis, outside the circle with AB as diameter.
        let positions = vec![(0.0, 0.0), (1.0, 0.0), (0.5, 2.0), (0.5, 0.1)];
        assert!(build_quad(&positions, [0, 1, 2, 3], 0.0, f64::MAX).is_none());
    }

    #[test]
    fn test_enumerate_covers_each_quad_once() {
        let positions: Vec<(f64, f64)> = vec![
            (0.0, 0.0),
            (100.0, 0.0),
            (40.0, 55.0),
            (60.0, 45.0),
            (30.0, 30.0),
            (80.0, 60.0),
        ];
        let mut seen = std::collections::HashSet::new();
        enumerate_quads(&positions, 0, positions.len(), 0.0, f64::MAX, &mut || true, &mut |q| {
            let mut key = q.stars;
            key.sort_unstable();
            assert!(seen.insert(key), "quad {:?} emitted twice", key);
            true
        });
        assert!(!seen.is_empty());
    }

    #[test]
    fn test_enumerate_respects_depth() {
        let positions: Vec<(f64, f64)> = (0..12)
            .map(|i| (i as f64 * 13.0 % 97.0, i as f64 * 29.0 % 83.0))
            .collect();
        let mut max_index = 0usize;
        enumerate_quads(&positions, 0, 6, 0.0, f64::MAX, &mut || true, &mut |q| {
            max_index = max_index.max(*q.stars.iter().max().unwrap());
            true
        });
        assert!(max_index < 6);
    }
}
