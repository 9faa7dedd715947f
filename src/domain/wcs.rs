//! SIP-augmented tangent (gnomonic) projection.
//!
//! Pixel coordinates are 1-based throughout: the center of the first pixel
//! is (1.0, 1.0), matching the star lists the extractor produces.

use serde::{Deserialize, Serialize};

use crate::model::params::Parity;

/// Unit direction vector for a sky position.
pub fn radec_to_xyz(ra_deg: f64, dec_deg: f64) -> [f64; 3] {
    let ra = ra_deg.to_radians();
    let dec = dec_deg.to_radians();
    [dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin()]
}

pub fn xyz_to_radec(v: [f64; 3]) -> (f64, f64) {
    let mut ra = v[1].atan2(v[0]).to_degrees();
    if ra < 0.0 {
        ra += 360.0;
    }
    let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    let dec = (v[2] / norm.max(1e-300)).clamp(-1.0, 1.0).asin().to_degrees();
    (ra, dec)
}

/// Chord length on the unit sphere subtending `angle_rad`.
pub fn chord_for_angle(angle_rad: f64) -> f64 {
    2.0 * (angle_rad / 2.0).sin()
}

/// Separation between two sky positions, degrees.
pub fn angular_separation(ra0: f64, dec0: f64, ra1: f64, dec1: f64) -> f64 {
    let d0 = dec0.to_radians();
    let d1 = dec1.to_radians();
    let dra = (ra1 - ra0).to_radians();
    let sin_dd = ((d1 - d0) / 2.0).sin();
    let sin_dr = (dra / 2.0).sin();
    let h = sin_dd * sin_dd + d0.cos() * d1.cos() * sin_dr * sin_dr;
    (2.0 * h.sqrt().clamp(-1.0, 1.0).asin()).to_degrees()
}

/// Position angle of p1 as seen from p0, degrees east of north.
/// Zero when the points are degenerate.
pub fn position_angle(ra0: f64, dec0: f64, ra1: f64, dec1: f64) -> f64 {
    let d0 = dec0.to_radians();
    let d1 = dec1.to_radians();
    let dra = (ra1 - ra0).to_radians();
    let sin_term = (0.5 * dra).sin();
    let y = (d1 - d0).sin() + 2.0 * d0.sin() * d1.cos() * sin_term * sin_term;
    let x = d0.cos() * dra.sin();
    x.atan2(y).to_degrees()
}

/// Polynomial distortion terms in the SIP convention.
///
/// Coefficients are stored row-major as `coef[p * (order + 1) + q]` for
/// the `u^p v^q` term; only entries with `2 <= p + q <= order` are used,
/// the linear part stays in the CD matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipTerms {
    pub order: usize,
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    pub ap: Vec<f64>,
    pub bp: Vec<f64>,
}

impl SipTerms {
    fn eval(coef: &[f64], order: usize, u: f64, v: f64) -> f64 {
        let mut acc = 0.0;
        for p in 0..=order {
            for q in 0..=(order - p) {
                if p + q < 2 {
                    continue;
                }
                acc += coef[p * (order + 1) + q] * u.powi(p as i32) * v.powi(q as i32);
            }
        }
        acc
    }
}

/// Tangent-projection WCS with optional SIP distortion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipWcs {
    pub crpix1: f64,
    pub crpix2: f64,
    pub crval1: f64,
    pub crval2: f64,
    /// Pixel-to-intermediate-world matrix, degrees per pixel.
    pub cd: [[f64; 2]; 2],
    pub sip: Option<SipTerms>,
}

impl SipWcs {
    pub fn pixel_to_world(&self, x: f64, y: f64) -> (f64, f64) {
        let mut u = x - self.crpix1;
        let mut v = y - self.crpix2;
        if let Some(sip) = &self.sip {
            let du = SipTerms::eval(&sip.a, sip.order, u, v);
            let dv = SipTerms::eval(&sip.b, sip.order, u, v);
            u += du;
            v += dv;
        }
        let xi = self.cd[0][0] * u + self.cd[0][1] * v;
        let eta = self.cd[1][0] * u + self.cd[1][1] * v;
        self.deproject(xi, eta)
    }

    pub fn world_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        let (xi, eta) = self.project(ra, dec)?;
        let det = self.det_cd();
        if det.abs() < 1e-30 {
            return None;
        }
        let inv_det = 1.0 / det;
        let mut u = inv_det * (self.cd[1][1] * xi - self.cd[0][1] * eta);
        let mut v = inv_det * (-self.cd[1][0] * xi + self.cd[0][0] * eta);
        if let Some(sip) = &self.sip {
            u += SipTerms::eval(&sip.ap, sip.order, u, v);
            v += SipTerms::eval(&sip.bp, sip.order, u, v);
        }
        Some((u + self.crpix1, v + self.crpix2))
    }

    fn deproject(&self, xi_deg: f64, eta_deg: f64) -> (f64, f64) {
        let xi = xi_deg.to_radians();
        let eta = eta_deg.to_radians();
        let ra0 = self.crval1.to_radians();
        let dec0 = self.crval2.to_radians();

        let denom = dec0.cos() - eta * dec0.sin();
        let ra = ra0 + xi.atan2(denom);
        let dec = (dec0.sin() + eta * dec0.cos()).atan2((xi * xi + denom * denom).sqrt());

        let mut ra_deg = ra.to_degrees();
        if ra_deg < 0.0 {
            ra_deg += 360.0;
        }
        if ra_deg >= 360.0 {
            ra_deg -= 360.0;
        }
        (ra_deg, dec.to_degrees())
    }

    fn project(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        let ra_r = ra.to_radians();
        let dec_r = dec.to_radians();
        let ra0 = self.crval1.to_radians();
        let dec0 = self.crval2.to_radians();
        let delta_ra = ra_r - ra0;

        let denom = dec_r.sin() * dec0.sin() + dec_r.cos() * dec0.cos() * delta_ra.cos();
        if denom <= 1e-15 {
            // Behind the tangent plane.
            return None;
        }
        let xi = (dec_r.cos() * delta_ra.sin()) / denom;
        let eta = (dec_r.sin() * dec0.cos() - dec_r.cos() * dec0.sin() * delta_ra.cos()) / denom;
        Some((xi.to_degrees(), eta.to_degrees()))
    }

    pub fn det_cd(&self) -> f64 {
        self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0]
    }

    /// Negative determinant is positive parity.
    pub fn parity(&self) -> Parity {
        if self.det_cd() < 0.0 { Parity::Positive } else { Parity::Negative }
    }

    pub fn pixel_scale_arcsec(&self) -> f64 {
        let scale_x = (self.cd[0][0].powi(2) + self.cd[1][0].powi(2)).sqrt();
        let scale_y = (self.cd[0][1].powi(2) + self.cd[1][1].powi(2)).sqrt();
        ((scale_x + scale_y) / 2.0) * 3600.0
    }

    /// Field rotation at `(x, y)`: degrees east of north of the image +y
    /// direction.
    pub fn orientation_deg(&self, x: f64, y: f64) -> f64 {
        let (ra0, dec0) = self.pixel_to_world(x, y);
        let (ra1, dec1) = self.pixel_to_world(x, y + 1.0);
        position_angle(ra0, dec0, ra1, dec1)
    }

    pub fn field_size_arcmin(&self, width: f64, height: f64) -> (f64, f64) {
        let scale = self.pixel_scale_arcsec() / 60.0;
        (width * scale, height * scale)
    }
}

/// Fit a TAN WCS to matched pixel/sky pairs by least squares: the tangent
/// point is the mean sky direction, the CD matrix and CRPIX come from the
/// first and second moments of the correspondence. Needs three or more
/// non-degenerate pairs.
pub fn fit_tan_wcs(pix: &[(f64, f64)], sky: &[(f64, f64)]) -> Option<SipWcs> {
    if pix.len() < 3 || pix.len() != sky.len() {
        return None;
    }

    let mut mean = [0.0f64; 3];
    for &(ra, dec) in sky {
        let v = radec_to_xyz(ra, dec);
        for i in 0..3 {
            mean[i] += v[i];
        }
    }
    let norm = (mean[0] * mean[0] + mean[1] * mean[1] + mean[2] * mean[2]).sqrt();
    if norm < 1e-12 {
        return None;
    }
    let (crval1, crval2) = xyz_to_radec(mean);

    let probe = SipWcs {
        crpix1: 0.0,
        crpix2: 0.0,
        crval1,
        crval2,
        cd: [[1.0, 0.0], [0.0, 1.0]],
        sip: None,
    };
    let mut tan: Vec<(f64, f64)> = Vec::with_capacity(sky.len());
    for &(ra, dec) in sky {
        tan.push(probe.project(ra, dec)?);
    }

    let n = pix.len() as f64;
    let pbar = (
        pix.iter().map(|p| p.0).sum::<f64>() / n,
        pix.iter().map(|p| p.1).sum::<f64>() / n,
    );
    let tbar = (
        tan.iter().map(|t| t.0).sum::<f64>() / n,
        tan.iter().map(|t| t.1).sum::<f64>() / n,
    );

    // Second moments of the pixels, cross moments tangent x pixel.
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    let mut cross = [[0.0f64; 2]; 2];
    for (&(px, py), &(tx, ty)) in pix.iter().zip(tan.iter()) {
        let dp = (px - pbar.0, py - pbar.1);
        let dt = (tx - tbar.0, ty - tbar.1);
        sxx += dp.0 * dp.0;
        sxy += dp.0 * dp.1;
        syy += dp.1 * dp.1;
        cross[0][0] += dt.0 * dp.0;
        cross[0][1] += dt.0 * dp.1;
        cross[1][0] += dt.1 * dp.0;
        cross[1][1] += dt.1 * dp.1;
    }
    let det_p = sxx * syy - sxy * sxy;
    if det_p.abs() < 1e-12 {
        return None;
    }
    let inv_p = [[syy / det_p, -sxy / det_p], [-sxy / det_p, sxx / det_p]];
    let mut cd = [[0.0f64; 2]; 2];
    for i in 0..2 {
        for j in 0..2 {
            cd[i][j] = cross[i][0] * inv_p[0][j] + cross[i][1] * inv_p[1][j];
        }
    }

    let det_cd = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
    if det_cd.abs() < 1e-30 {
        return None;
    }
    let inv_cd = [
        [cd[1][1] / det_cd, -cd[0][1] / det_cd],
        [-cd[1][0] / det_cd, cd[0][0] / det_cd],
    ];
    let crpix1 = pbar.0 - (inv_cd[0][0] * tbar.0 + inv_cd[0][1] * tbar.1);
    let crpix2 = pbar.1 - (inv_cd[1][0] * tbar.0 + inv_cd[1][1] * tbar.1);

    Some(SipWcs { crpix1, crpix2, crval1, crval2, cd, sip: None })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn simple_wcs() -> SipWcs {
        SipWcs {
            crpix1: 256.0,
            crpix2: 256.0,
            crval1: 180.0,
            crval2: 45.0,
            cd: [[-0.001, 0.0], [0.0, 0.001]],
            sip: None,
        }
    }

    #[test]
    fn test_identity_at_reference() {
        let wcs = simple_wcs();
        let (ra, dec) = wcs.pixel_to_world(256.0, 256.0);
        assert!((ra - 180.0).abs() < 1e-9);
        assert!((dec - 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_roundtrip() {
        let wcs = simple_wcs();
        let (ra, dec) = wcs.pixel_to_world(150.0, 200.0);
        let (px, py) = wcs.world_to_pixel(ra, dec).unwrap();
        assert!((px - 150.0).abs() < 1e-6);
        assert!((py - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_pixel_scale() {
        let wcs = simple_wcs();
        assert!((wcs.pixel_scale_arcsec() - 3.6).abs() < 0.01);
    }

    #[test]
    fn test_parity_follows_det() {
        let mut wcs = simple_wcs();
        assert_eq!(wcs.parity(), Parity::Positive);
        wcs.cd[0][0] = 0.001;
        assert_eq!(wcs.parity(), Parity::Negative);
    }

    #[test]
    fn test_angular_separation() {
        assert_abs_diff_eq!(angular_separation(0.0, 0.0, 90.0, 0.0), 90.0, epsilon = 1e-9);
        assert_abs_diff_eq!(angular_separation(10.0, 20.0, 10.0, 21.0), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_position_angle_north_east() {
        // Due north.
        assert_abs_diff_eq!(position_angle(180.0, 10.0, 180.0, 11.0), 0.0, epsilon = 1e-6);
        // Due east.
        assert_abs_diff_eq!(position_angle(180.0, 0.0, 181.0, 0.0), 90.0, epsilon = 1e-6);
    }

    #[test]
    fn test_fit_recovers_known_wcs() {
        let truth = SipWcs {
            crpix1: 320.0,
            crpix2: 240.0,
            crval1: 83.6,
            crval2: 22.0,
            cd: [[-0.0008, 0.0003], [0.0003, 0.0008]],
            sip: None,
        };
        let pts = [(100.0, 100.0), (500.0, 120.0), (150.0, 400.0), (480.0, 430.0)];
        let sky: Vec<(f64, f64)> = pts.iter().map(|&(x, y)| truth.pixel_to_world(x, y)).collect();
        let fitted = fit_tan_wcs(&pts, &sky).unwrap();

        for &(x, y) in &pts {
            let (ra_t, dec_t) = truth.pixel_to_world(x, y);
            let (ra_f, dec_f) = fitted.pixel_to_world(x, y);
            assert!(angular_separation(ra_t, dec_t, ra_f, dec_f) < 2e-4);
        }
        assert!((fitted.pixel_scale_arcsec() - truth.pixel_scale_arcsec()).abs()
            / truth.pixel_scale_arcsec()
            < 0.01);
    }

    #[test]
    fn test_fit_rejects_collinear() {
        let pts = [(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (3.0, 0.0)];
        let sky = [(10.0, 10.0), (10.1, 10.0), (10.2, 10.0), (10.3, 10.0)];
        assert!(fit_tan_wcs(&pts, &sky).is_none());
    }

    #[test]
    fn test_sip_terms_applied() {
        let order = 2;
        let mut a = vec![0.0; (order + 1) * (order + 1)];
        let b = vec![0.0; (order + 1) * (order + 1)];
        // A_2_0 = 1e-6: u' = u + 1e-6 u^2.
        a[2 * (order + 1)] = 1e-6;
        let mut wcs = simple_wcs();
        wcs.sip = Some(SipTerms { order, a, b, ap: vec![0.0; 9], bp: vec![0.0; 9] });

        let (ra_sip, _) = wcs.pixel_to_world(356.0, 256.0);
        let plain = simple_wcs();
        let (ra_plain, _) = plain.pixel_to_world(356.0, 256.0);
        assert!((ra_sip - ra_plain).abs() > 1e-7);
    }

    #[test]
    fn test_world_to_pixel_rejects_antipode() {
        let wcs = simple_wcs();
        assert!(wcs.world_to_pixel(0.0, -45.0).is_none());
    }
}
