//! Connected-component source extraction over one working plane.
//!
//! Detection runs on the plane convolved with the normalized matched
//! filter; centroids, moments and photometry use the unconvolved,
//! background-subtracted plane. The threshold is `2 * global_rms`.

use anyhow::{bail, Context, Result};
use ndarray::Array2;

use crate::domain::background::BackgroundMap;
use crate::model::{ApertureShape, Parameters, Star};

/// Reference aperture radius for the half-flux computation, pixels.
const HFR_MAX_RADIUS: f64 = 50.0;
/// Kron integration extends to this many normalized ellipse radii.
const KRON_RMAX: f64 = 6.0;

pub struct TileExtraction {
    pub stars: Vec<Star>,
    pub background: crate::model::Background,
}

#[derive(Debug, Clone)]
struct Measured {
    /// 0-based centroid.
    x: f64,
    y: f64,
    a: f64,
    b: f64,
    /// Radians.
    theta: f64,
    cxx: f64,
    cyy: f64,
    cxy: f64,
    /// Isophotal flux of the thresholded group.
    flux_iso: f64,
    peak: f64,
    npix: usize,
}

/// Extract every source from `plane`. The plane is background-subtracted
/// in place.
pub fn extract_tile(
    plane: &mut Array2<f32>,
    params: &Parameters,
    compute_hfr: bool,
) -> Result<TileExtraction> {
    let side = params
        .conv_filter_side()
        .context("convolution kernel must be a non-empty odd-sided square")?;

    let bkg = BackgroundMap::estimate(plane);
    bkg.subtract(plane);
    let threshold = 2.0 * bkg.global_rms;

    let conv = convolve(plane, &params.conv_filter, side)?;
    let components = find_components(&conv, threshold, params.minarea);

    let mut measured: Vec<Measured> = Vec::new();
    for component in &components {
        for group in deblend(
            component,
            &conv,
            threshold,
            params.deblend_thresh,
            params.deblend_contrast,
        ) {
            if group.len() < params.minarea {
                continue;
            }
            if let Some(m) = measure(&group, plane) {
                measured.push(m);
            }
        }
    }

    if params.clean {
        clean_detections(&mut measured, params.clean_param);
    }
    let num_detected = measured.len() as u32;

    // Oval size correlates well with HFR and magnitude; process the
    // largest detections first so initial_keep keeps the useful ones.
    measured.sort_by(|m1, m2| {
        let s1 = m1.a * m1.a + m1.b * m1.b;
        let s2 = m2.a * m2.a + m2.b * m2.b;
        s2.partial_cmp(&s1).unwrap_or(std::cmp::Ordering::Equal)
    });
    measured.truncate(params.initial_keep);

    let mut stars = Vec::with_capacity(measured.len());
    for m in &measured {
        let flux = aperture_flux(plane, m, params);
        let flux = if flux > 0.0 { flux } else { m.flux_iso.max(f64::MIN_POSITIVE) };
        let mag = params.magzero - 2.5 * flux.log10();
        let hfr = if compute_hfr {
            half_flux_radius(plane, m.x, m.y, HFR_MAX_RADIUS)
        } else {
            0.0
        };

        // The center of the first pixel is (1.0, 1.0).
        stars.push(Star {
            x: (m.x + 1.0) as f32,
            y: (m.y + 1.0) as f32,
            mag: mag as f32,
            flux: flux as f32,
            peak: m.peak as f32,
            hfr: hfr as f32,
            a: m.a as f32,
            b: m.b as f32,
            theta: m.theta.to_degrees() as f32,
            ra: f64::NAN,
            dec: f64::NAN,
            num_pixels: m.npix as u32,
        });
    }

    Ok(TileExtraction { stars, background: bkg.summary(num_detected) })
}

/// Convolution with the normalized kernel, zero-padded at the edges.
fn convolve(plane: &Array2<f32>, kernel: &[f32], side: usize) -> Result<Array2<f32>> {
    let sum: f32 = kernel.iter().sum();
    if sum.abs() < f32::EPSILON {
        bail!("convolution kernel sums to zero");
    }
    let norm: Vec<f32> = kernel.iter().map(|&k| k / sum).collect();
    let half = (side / 2) as isize;
    let (rows, cols) = plane.dim();
    let mut out = Array2::<f32>::zeros((rows, cols));

    for y in 0..rows as isize {
        for x in 0..cols as isize {
            let mut acc = 0.0f32;
            for ky in -half..=half {
                let yy = y + ky;
                if yy < 0 || yy >= rows as isize {
                    continue;
                }
                let krow = ((ky + half) as usize) * side;
                for kx in -half..=half {
                    let xx = x + kx;
                    if xx < 0 || xx >= cols as isize {
                        continue;
                    }
                    acc += norm[krow + (kx + half) as usize] * plane[[yy as usize, xx as usize]];
                }
            }
            out[[y as usize, x as usize]] = acc;
        }
    }
    Ok(out)
}

const NEIGHBORS: [(isize, isize); 8] =
    [(-1, 0), (1, 0), (0, -1), (0, 1), (-1, -1), (-1, 1), (1, -1), (1, 1)];

/// 8-connected groups of above-threshold pixels, at least `minarea` large.
fn find_components(
    conv: &Array2<f32>,
    threshold: f32,
    minarea: usize,
) -> Vec<Vec<(usize, usize)>> {
    let (rows, cols) = conv.dim();
    let mut visited = Array2::<bool>::default((rows, cols));
    let mut components = Vec::new();
    let mut queue: std::collections::VecDeque<(usize, usize)> = std::collections::VecDeque::new();

    for r in 0..rows {
        for c in 0..cols {
            let v = conv[[r, c]];
            if v <= threshold || visited[[r, c]] || !v.is_finite() {
                continue;
            }
            let mut component = Vec::new();
            queue.push_back((r, c));
            visited[[r, c]] = true;
            while let Some((cr, cc)) = queue.pop_front() {
                component.push((cr, cc));
                for (dr, dc) in &NEIGHBORS {
                    let nr = cr as isize + dr;
                    let nc = cc as isize + dc;
                    if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                        continue;
                    }
                    let (nr, nc) = (nr as usize, nc as usize);
                    if !visited[[nr, nc]] && conv[[nr, nc]] > threshold && conv[[nr, nc]].is_finite()
                    {
                        visited[[nr, nc]] = true;
                        queue.push_back((nr, nc));
                    }
                }
            }
            if component.len() >= minarea {
                components.push(component);
            }
        }
    }
    components
}

/// Multi-threshold deblending by descending flood assignment.
///
/// Pixels are visited brightest-level first; a pixel with no assigned
/// neighbor seeds a new peak, a pixel bridging two peaks merges them
/// unless both carry at least `contrast` of the total component flux.
fn deblend(
    pixels: &[(usize, usize)],
    conv: &Array2<f32>,
    threshold: f32,
    nthresh: u32,
    contrast: f64,
) -> Vec<Vec<(usize, usize)>> {
    if contrast >= 1.0 || nthresh < 2 || pixels.len() < 4 {
        return vec![pixels.to_vec()];
    }
    let total_flux: f64 = pixels.iter().map(|&p| conv[[p.0, p.1]] as f64).sum();
    let peak = pixels
        .iter()
        .map(|&p| conv[[p.0, p.1]])
        .fold(f32::MIN, f32::max);
    if peak <= threshold || total_flux <= 0.0 {
        return vec![pixels.to_vec()];
    }

    // Exponentially spaced intensity levels between threshold and peak.
    let log_span = (peak / threshold).max(1.0 + f32::EPSILON).ln();
    let level_of = |v: f32| -> u32 {
        if v <= threshold {
            return 0;
        }
        (((v / threshold).ln() / log_span) * nthresh as f32)
            .floor()
            .min(nthresh as f32 - 1.0) as u32
    };

    let mut order: Vec<usize> = (0..pixels.len()).collect();
    order.sort_by(|&i, &j| {
        let vi = conv[[pixels[i].0, pixels[i].1]];
        let vj = conv[[pixels[j].0, pixels[j].1]];
        (level_of(vj), vj)
            .partial_cmp(&(level_of(vi), vi))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut assignment: std::collections::HashMap<(usize, usize), usize> =
        std::collections::HashMap::with_capacity(pixels.len());
    let mut parent: Vec<usize> = Vec::new();
    let mut flux: Vec<f64> = Vec::new();

    fn find(parent: &mut Vec<usize>, mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for &pi in &order {
        let (r, c) = pixels[pi];
        let v = conv[[r, c]] as f64;
        let mut roots: Vec<usize> = Vec::new();
        for (dr, dc) in &NEIGHBORS {
            let nr = r as isize + dr;
            let nc = c as isize + dc;
            if nr < 0 || nc < 0 {
                continue;
            }
            if let Some(&basin) = assignment.get(&(nr as usize, nc as usize)) {
                let root = find(&mut parent, basin);
                if !roots.contains(&root) {
                    roots.push(root);
                }
            }
        }
        match roots.len() {
            0 => {
                let id = parent.len();
                parent.push(id);
                flux.push(v);
                assignment.insert((r, c), id);
            }
            1 => {
                flux[roots[0]] += v;
                assignment.insert((r, c), roots[0]);
            }
            _ => {
                let main = roots
                    .iter()
                    .copied()
                    .max_by(|&i, &j| flux[i].partial_cmp(&flux[j]).unwrap())
                    .unwrap();
                for &other in roots.iter().filter(|&&rt| rt != main) {
                    let both_significant = flux[other] >= contrast * total_flux
                        && flux[main] >= contrast * total_flux;
                    if !both_significant {
                        parent[other] = main;
                        flux[main] += flux[other];
                    }
                }
                flux[main] += v;
                assignment.insert((r, c), main);
            }
        }
    }

    let mut groups: std::collections::HashMap<usize, Vec<(usize, usize)>> =
        std::collections::HashMap::new();
    for (&pixel, &basin) in &assignment {
        let root = find(&mut parent, basin);
        groups.entry(root).or_default().push(pixel);
    }
    let mut out: Vec<Vec<(usize, usize)>> = groups.into_values().collect();
    // Deterministic order for callers.
    out.sort_by_key(|g| g.iter().copied().min().unwrap_or((0, 0)));
    out
}

/// Merge detections sitting in a brighter neighbor's skirt.
fn clean_detections(objects: &mut Vec<Measured>, clean_param: f64) {
    objects.sort_by(|m1, m2| {
        m2.flux_iso
            .partial_cmp(&m1.flux_iso)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut i = 0;
    while i < objects.len() {
        let mut j = i + 1;
        while j < objects.len() {
            let dx = objects[i].x - objects[j].x;
            let dy = objects[i].y - objects[j].y;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist < clean_param * (objects[i].a + objects[j].a) {
                let absorbed = objects.remove(j);
                objects[i].flux_iso += absorbed.flux_iso;
                objects[i].npix += absorbed.npix;
                objects[i].peak = objects[i].peak.max(absorbed.peak);
            } else {
                j += 1;
            }
        }
        i += 1;
    }
}

/// First and second moments of a pixel group on the unconvolved plane.
fn measure(pixels: &[(usize, usize)], plane: &Array2<f32>) -> Option<Measured> {
    let mut flux = 0.0f64;
    let mut sx = 0.0f64;
    let mut sy = 0.0f64;
    let mut peak = 0.0f64;
    for &(r, c) in pixels {
        let v = (plane[[r, c]] as f64).max(0.0);
        flux += v;
        sx += c as f64 * v;
        sy += r as f64 * v;
        peak = peak.max(v);
    }
    if flux <= 0.0 {
        return None;
    }
    let x = sx / flux;
    let y = sy / flux;

    let mut x2 = 0.0f64;
    let mut y2 = 0.0f64;
    let mut xy = 0.0f64;
    for &(r, c) in pixels {
        let v = (plane[[r, c]] as f64).max(0.0);
        let dx = c as f64 - x;
        let dy = r as f64 - y;
        x2 += dx * dx * v;
        y2 += dy * dy * v;
        xy += dx * dy * v;
    }
    x2 /= flux;
    y2 /= flux;
    xy /= flux;

    // Pixelization variance keeps degenerate (single-row/column) groups
    // from collapsing to a zero-width ellipse.
    if x2 * y2 - xy * xy < 1e-6 {
        x2 += 1.0 / 12.0;
        y2 += 1.0 / 12.0;
    }

    let half_sum = (x2 + y2) / 2.0;
    let diff = (x2 - y2) / 2.0;
    let root = (diff * diff + xy * xy).sqrt();
    let a = (half_sum + root).max(1e-6).sqrt();
    let b = (half_sum - root).max(1e-6).sqrt();
    let theta = 0.5 * (2.0 * xy).atan2(x2 - y2);

    let (cos_t, sin_t) = (theta.cos(), theta.sin());
    let (a2, b2) = (a * a, b * b);
    let cxx = cos_t * cos_t / a2 + sin_t * sin_t / b2;
    let cyy = sin_t * sin_t / a2 + cos_t * cos_t / b2;
    let cxy = 2.0 * cos_t * sin_t * (1.0 / a2 - 1.0 / b2);

    Some(Measured {
        x,
        y,
        a,
        b,
        theta,
        cxx,
        cyy,
        cxy,
        flux_iso: flux,
        peak,
        npix: pixels.len(),
    })
}

/// Flux-weighted Kron radius in normalized ellipse units.
fn kron_radius(plane: &Array2<f32>, m: &Measured) -> f64 {
    let (rows, cols) = plane.dim();
    let reach = (m.a * KRON_RMAX).ceil() as isize + 1;
    let cx = m.x.round() as isize;
    let cy = m.y.round() as isize;
    let mut sum_vr = 0.0f64;
    let mut sum_v = 0.0f64;
    for r in (cy - reach).max(0)..(cy + reach + 1).min(rows as isize) {
        for c in (cx - reach).max(0)..(cx + reach + 1).min(cols as isize) {
            let dx = c as f64 - m.x;
            let dy = r as f64 - m.y;
            let rr = (m.cxx * dx * dx + m.cyy * dy * dy + m.cxy * dx * dy).max(0.0).sqrt();
            if rr > KRON_RMAX {
                continue;
            }
            let v = (plane[[r as usize, c as usize]] as f64).max(0.0);
            sum_vr += v * rr;
            sum_v += v;
        }
    }
    if sum_v > 0.0 { sum_vr / sum_v } else { 0.0 }
}

/// Circular aperture sum with sub-pixel boundary sampling.
fn sum_circle(plane: &Array2<f32>, cx: f64, cy: f64, radius: f64, subpix: u32) -> f64 {
    let (rows, cols) = plane.dim();
    let reach = radius.ceil() as isize + 1;
    let icx = cx.round() as isize;
    let icy = cy.round() as isize;
    let r2 = radius * radius;
    let mut sum = 0.0f64;

    for r in (icy - reach).max(0)..(icy + reach + 1).min(rows as isize) {
        for c in (icx - reach).max(0)..(icx + reach + 1).min(cols as isize) {
            let dx = c as f64 - cx;
            let dy = r as f64 - cy;
            let dist = (dx * dx + dy * dy).sqrt();
            let v = plane[[r as usize, c as usize]] as f64;
            if dist <= radius - std::f64::consts::FRAC_1_SQRT_2 {
                sum += v;
            } else if dist < radius + std::f64::consts::FRAC_1_SQRT_2 {
                sum += v * pixel_fraction(subpix, |sx, sy| {
                    let fx = dx + sx;
                    let fy = dy + sy;
                    fx * fx + fy * fy <= r2
                });
            }
        }
    }
    sum
}

/// Elliptical aperture sum out to `scale_r` normalized radii.
fn sum_ellipse(plane: &Array2<f32>, m: &Measured, scale_r: f64, subpix: u32) -> f64 {
    let (rows, cols) = plane.dim();
    let reach = (m.a * scale_r).ceil() as isize + 1;
    let icx = m.x.round() as isize;
    let icy = m.y.round() as isize;
    // Normalized-radius width of one pixel along the steepest gradient.
    let margin = std::f64::consts::FRAC_1_SQRT_2 / m.b.max(1e-3);
    let mut sum = 0.0f64;

    for r in (icy - reach).max(0)..(icy + reach + 1).min(rows as isize) {
        for c in (icx - reach).max(0)..(icx + reach + 1).min(cols as isize) {
            let dx = c as f64 - m.x;
            let dy = r as f64 - m.y;
            let rr = (m.cxx * dx * dx + m.cyy * dy * dy + m.cxy * dx * dy).max(0.0).sqrt();
            let v = plane[[r as usize, c as usize]] as f64;
            if rr <= scale_r - margin {
                sum += v;
            } else if rr < scale_r + margin {
                sum += v * pixel_fraction(subpix, |sx, sy| {
                    let fx = dx + sx;
                    let fy = dy + sy;
                    (m.cxx * fx * fx + m.cyy * fy * fy + m.cxy * fx * fy).max(0.0).sqrt() <= scale_r
                });
            }
        }
    }
    sum
}

/// Fraction of a pixel inside the aperture, on a subpix x subpix grid.
fn pixel_fraction(subpix: u32, mut inside: impl FnMut(f64, f64) -> bool) -> f64 {
    if subpix <= 1 {
        return if inside(0.0, 0.0) { 1.0 } else { 0.0 };
    }
    let n = subpix as f64;
    let mut hits = 0u32;
    for sy in 0..subpix {
        for sx in 0..subpix {
            let fx = (sx as f64 + 0.5) / n - 0.5;
            let fy = (sy as f64 + 0.5) / n - 0.5;
            if inside(fx, fy) {
                hits += 1;
            }
        }
    }
    hits as f64 / (n * n)
}

/// Photometric flux over the configured aperture.
fn aperture_flux(plane: &Array2<f32>, m: &Measured, params: &Parameters) -> f64 {
    if params.inflags != 0 {
        log::debug!("aperture inflags {:#x} requested; apertures are edge-truncated", params.inflags);
    }
    let use_circle = match params.aperture_shape {
        ApertureShape::Circle => true,
        ApertureShape::Ellipse => false,
        ApertureShape::Auto => {
            let kr = kron_radius(plane, m);
            kr * (m.a * m.b).sqrt() < params.r_min
        }
    };
    if use_circle {
        sum_circle(plane, m.x, m.y, params.r_min, params.subpix)
    } else {
        let kr = kron_radius(plane, m);
        sum_ellipse(plane, m, params.kron_fact * kr, params.subpix)
    }
}

/// Radius enclosing half the flux of the 50-px reference aperture,
/// interpolated on the cumulative radial profile.
fn half_flux_radius(plane: &Array2<f32>, cx: f64, cy: f64, max_radius: f64) -> f64 {
    let (rows, cols) = plane.dim();
    let reach = max_radius.ceil() as isize;
    let icx = cx.round() as isize;
    let icy = cy.round() as isize;
    let nbins = max_radius.ceil() as usize + 1;
    let mut bins = vec![0.0f64; nbins];

    for r in (icy - reach).max(0)..(icy + reach + 1).min(rows as isize) {
        for c in (icx - reach).max(0)..(icx + reach + 1).min(cols as isize) {
            let dx = c as f64 - cx;
            let dy = r as f64 - cy;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist > max_radius {
                continue;
            }
            bins[dist.floor() as usize] += (plane[[r as usize, c as usize]] as f64).max(0.0);
        }
    }

    let total: f64 = bins.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let half = 0.5 * total;
    let mut cum = 0.0f64;
    for (i, &bin) in bins.iter().enumerate() {
        if cum + bin >= half {
            let frac = if bin > 0.0 { (half - cum) / bin } else { 0.0 };
            return i as f64 + frac;
        }
        cum += bin;
    }
    max_radius
}
