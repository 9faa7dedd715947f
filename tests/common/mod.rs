//! Shared fixtures: synthetic star fields, reference catalogs, and index
//! files in the on-disk format the engine consumes.

#![allow(dead_code)]

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use starsolve::domain::quads;
use starsolve::domain::wcs::SipWcs;
use starsolve::{SampleType, Statistic};

/// Route engine logs through the test harness when RUST_LOG is set.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One injected star: 1-based position and peak amplitude.
#[derive(Debug, Clone, Copy)]
pub struct Injected {
    pub x: f64,
    pub y: f64,
    pub peak: f64,
}

/// Approximate unit Gaussian via the sum of twelve uniforms.
fn gaussian_noise(rng: &mut StdRng) -> f64 {
    (0..12).map(|_| rng.gen::<f64>()).sum::<f64>() - 6.0
}

/// Render Gaussian stars onto a u16 frame with a flat background and
/// Gaussian noise. Star positions are 1-based.
pub fn render_u16_frame(
    width: u32,
    height: u32,
    stars: &[Injected],
    sigma: f64,
    background: f64,
    noise_sigma: f64,
    seed: u64,
) -> (Statistic, Vec<u8>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let w = width as usize;
    let h = height as usize;
    let mut plane = vec![0.0f64; w * h];

    for row in 0..h {
        for col in 0..w {
            plane[row * w + col] = background + noise_sigma * gaussian_noise(&mut rng);
        }
    }

    let reach = (6.0 * sigma).ceil() as isize;
    for star in stars {
        // 1-based star position over 0-based pixel indices.
        let cx = star.x - 1.0;
        let cy = star.y - 1.0;
        let icx = cx.round() as isize;
        let icy = cy.round() as isize;
        for row in (icy - reach).max(0)..(icy + reach + 1).min(h as isize) {
            for col in (icx - reach).max(0)..(icx + reach + 1).min(w as isize) {
                let dx = col as f64 - cx;
                let dy = row as f64 - cy;
                plane[row as usize * w + col as usize] +=
                    star.peak * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            }
        }
    }

    let mut buffer = Vec::with_capacity(w * h * 2);
    for v in plane {
        buffer.extend_from_slice(&(v.clamp(0.0, 65535.0) as u16).to_ne_bytes());
    }
    (Statistic::new(width, height, 1, SampleType::U16), buffer)
}

/// Scatter stars with a minimum mutual separation, 1-based coordinates
/// inside the given margin. Peaks descend from `peak_hi` to `peak_lo`.
pub fn scatter_stars(
    width: u32,
    height: u32,
    count: usize,
    min_separation: f64,
    margin: f64,
    peak_hi: f64,
    peak_lo: f64,
    seed: u64,
) -> Vec<Injected> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut stars: Vec<Injected> = Vec::with_capacity(count);
    let ratio = (peak_lo / peak_hi).powf(1.0 / (count.max(2) - 1) as f64);
    let mut attempts = 0;
    while stars.len() < count && attempts < 100_000 {
        attempts += 1;
        let x = margin + rng.gen::<f64>() * (width as f64 - 2.0 * margin);
        let y = margin + rng.gen::<f64>() * (height as f64 - 2.0 * margin);
        let clear = stars
            .iter()
            .all(|s| ((s.x - x).powi(2) + (s.y - y).powi(2)).sqrt() >= min_separation);
        if clear {
            let peak = peak_hi * ratio.powi(stars.len() as i32);
            stars.push(Injected { x, y, peak });
        }
    }
    assert_eq!(stars.len(), count, "could not scatter {} stars", count);
    stars
}

/// A square-pixel TAN WCS with the given rotation; negative determinant
/// (positive parity), like a typical fork-mounted refractor frame.
pub fn truth_wcs(
    ra_center: f64,
    dec_center: f64,
    width: u32,
    height: u32,
    arcsec_per_pixel: f64,
    rotation_deg: f64,
) -> SipWcs {
    let s = arcsec_per_pixel / 3600.0;
    let (sin_t, cos_t) = rotation_deg.to_radians().sin_cos();
    SipWcs {
        crpix1: (width as f64 + 1.0) / 2.0,
        crpix2: (height as f64 + 1.0) / 2.0,
        crval1: ra_center,
        crval2: dec_center,
        cd: [[-s * cos_t, s * sin_t], [s * sin_t, s * cos_t]],
        sip: None,
    }
}

/// Random reference catalog in a box around a sky position.
pub fn make_catalog(
    ra_center: f64,
    dec_center: f64,
    half_width_deg: f64,
    count: usize,
    seed: u64,
) -> Vec<(f64, f64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            (
                ra_center + (rng.gen::<f64>() - 0.5) * 2.0 * half_width_deg,
                dec_center + (rng.gen::<f64>() - 0.5) * 2.0 * half_width_deg,
            )
        })
        .collect()
}

/// Build an index file over `catalog`: stars plus every canonical quad
/// whose backbone falls in `band_arcsec`, capped at `max_quads`.
pub fn write_index_file(
    path: &Path,
    index_id: u32,
    catalog: &[(f64, f64)],
    band_arcsec: (f64, f64),
    code_tol: f64,
    max_quads: usize,
) {
    // Identity-CD probe: world_to_pixel yields tangent-plane degrees
    // around the catalog centroid.
    let ra0 = catalog.iter().map(|s| s.0).sum::<f64>() / catalog.len() as f64;
    let dec0 = catalog.iter().map(|s| s.1).sum::<f64>() / catalog.len() as f64;
    let probe = SipWcs {
        crpix1: 0.0,
        crpix2: 0.0,
        crval1: ra0,
        crval2: dec0,
        cd: [[1.0, 0.0], [0.0, 1.0]],
        sip: None,
    };
    let tangent: Vec<(f64, f64)> = catalog
        .iter()
        .map(|&(ra, dec)| probe.world_to_pixel(ra, dec).expect("catalog star behind tangent"))
        .collect();

    let mut quads: Vec<([u32; 4], [f64; 4])> = Vec::new();
    quads::enumerate_quads(
        &tangent,
        0,
        tangent.len(),
        band_arcsec.0 / 3600.0,
        band_arcsec.1 / 3600.0,
        &mut || true,
        &mut |quad| {
            quads.push((
                [
                    quad.stars[0] as u32,
                    quad.stars[1] as u32,
                    quad.stars[2] as u32,
                    quad.stars[3] as u32,
                ],
                quad.code,
            ));
            quads.len() < max_quads
        },
    );
    assert!(!quads.is_empty(), "catalog produced no quads in band");

    let mut bytes: Vec<u8> = Vec::new();
    bytes.extend_from_slice(b"SSIX");
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&index_id.to_le_bytes());
    bytes.extend_from_slice(&band_arcsec.0.to_le_bytes());
    bytes.extend_from_slice(&band_arcsec.1.to_le_bytes());
    bytes.extend_from_slice(&code_tol.to_le_bytes());
    bytes.extend_from_slice(&(catalog.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(quads.len() as u32).to_le_bytes());
    for &(ra, dec) in catalog {
        bytes.extend_from_slice(&ra.to_le_bytes());
        bytes.extend_from_slice(&dec.to_le_bytes());
    }
    for (ids, code) in &quads {
        for id in ids {
            bytes.extend_from_slice(&id.to_le_bytes());
        }
        for c in code {
            bytes.extend_from_slice(&c.to_le_bytes());
        }
    }
    std::fs::write(path, &bytes).unwrap();
}

/// A complete solvable scene: catalog, index on disk, and a rendered
/// frame whose WCS is known.
pub struct Scene {
    pub stats: Statistic,
    pub buffer: Vec<u8>,
    pub wcs: SipWcs,
    pub catalog: Vec<(f64, f64)>,
    pub rendered: Vec<Injected>,
}

pub fn solvable_scene(index_path: &Path, width: u32, height: u32, seed: u64) -> Scene {
    let (ra_c, dec_c) = (180.0, 10.0);
    let arcsec_per_pixel = 4.0;
    let half_width = width as f64 * arcsec_per_pixel / 3600.0 * 0.55;
    let catalog = make_catalog(ra_c, dec_c, half_width, 60, seed);
    write_index_file(index_path, 7, &catalog, (600.0, 1500.0), 0.008, 50_000);

    let wcs = truth_wcs(ra_c, dec_c, width, height, arcsec_per_pixel, 25.0);
    let mut rendered = Vec::new();
    let margin = 12.0;
    for (rank, &(ra, dec)) in catalog.iter().enumerate() {
        if let Some((x, y)) = wcs.world_to_pixel(ra, dec) {
            if x >= margin
                && x <= width as f64 - margin
                && y >= margin
                && y <= height as f64 - margin
            {
                let peak = 50000.0 * 0.95f64.powi(rank as i32) + 2000.0;
                rendered.push(Injected { x, y, peak });
            }
        }
    }
    assert!(rendered.len() >= 20, "only {} stars land on the frame", rendered.len());

    let (stats, buffer) = render_u16_frame(width, height, &rendered, 1.5, 100.0, 5.0, seed ^ 0x5eed);
    Scene { stats, buffer, wcs, catalog, rendered }
}
