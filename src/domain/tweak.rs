//! WCS refinement: fit SIP distortion polynomials to the matched
//! correspondences of a passing trial.

use log::debug;

use crate::domain::wcs::{SipTerms, SipWcs};

/// Default polynomial order for both the forward and inverse terms.
pub const DEFAULT_SIP_ORDER: usize = 2;

/// Distortion basis: u^p v^q for 2 <= p + q <= order.
fn basis_exponents(order: usize) -> Vec<(usize, usize)> {
    let mut terms = Vec::new();
    for p in 0..=order {
        for q in 0..=(order - p) {
            if p + q >= 2 {
                terms.push((p, q));
            }
        }
    }
    terms
}

/// Dense Gaussian elimination with partial pivoting.
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[i][col].abs().partial_cmp(&a[j][col].abs()).unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut acc = b[row];
        for k in row + 1..n {
            acc -= a[row][k] * x[k];
        }
        x[row] = acc / a[row][row];
    }
    Some(x)
}

/// Least-squares polynomial fit of `targets` over the basis evaluated at
/// `points`. Returns None when the normal equations are singular.
fn fit_poly(
    points: &[(f64, f64)],
    targets: &[f64],
    exponents: &[(usize, usize)],
) -> Option<Vec<f64>> {
    let t = exponents.len();
    if points.len() < t {
        return None;
    }
    let mut normal = vec![vec![0.0f64; t]; t];
    let mut rhs = vec![0.0f64; t];
    let mut phi = vec![0.0f64; t];
    for (&(u, v), &target) in points.iter().zip(targets.iter()) {
        for (k, &(p, q)) in exponents.iter().enumerate() {
            phi[k] = u.powi(p as i32) * v.powi(q as i32);
        }
        for i in 0..t {
            for j in 0..t {
                normal[i][j] += phi[i] * phi[j];
            }
            rhs[i] += phi[i] * target;
        }
    }
    solve_linear(normal, rhs)
}

fn pack_coefficients(order: usize, exponents: &[(usize, usize)], fitted: &[f64]) -> Vec<f64> {
    let mut coef = vec![0.0; (order + 1) * (order + 1)];
    for (&(p, q), &c) in exponents.iter().zip(fitted.iter()) {
        coef[p * (order + 1) + q] = c;
    }
    coef
}

/// Fit forward (A/B) and inverse (AP/BP) distortion terms of the given
/// order against the matched correspondences. A singular or underdetermined
/// fit returns the input WCS unchanged.
pub fn tweak_wcs(wcs: &SipWcs, correspondences: &[((f64, f64), (f64, f64))], order: usize) -> SipWcs {
    let exponents = basis_exponents(order);

    if wcs.det_cd().abs() < 1e-30 {
        return wcs.clone();
    }

    // Linear probe with SIP stripped: residuals against it are what the
    // polynomials have to absorb.
    let linear = SipWcs { sip: None, ..wcs.clone() };

    let mut uv = Vec::with_capacity(correspondences.len());
    let mut capital_uv = Vec::with_capacity(correspondences.len());
    let mut du = Vec::with_capacity(correspondences.len());
    let mut dv = Vec::with_capacity(correspondences.len());
    for &((px, py), (ra, dec)) in correspondences {
        let u = px - wcs.crpix1;
        let v = py - wcs.crpix2;
        // Ideal linear pixel offsets for the catalog position.
        let Some((ideal_x, ideal_y)) = linear.world_to_pixel(ra, dec) else {
            continue;
        };
        let cap_u = ideal_x - wcs.crpix1;
        let cap_v = ideal_y - wcs.crpix2;
        uv.push((u, v));
        capital_uv.push((cap_u, cap_v));
        du.push(cap_u - u);
        dv.push(cap_v - v);
    }

    let (Some(a), Some(b)) = (
        fit_poly(&uv, &du, &exponents),
        fit_poly(&uv, &dv, &exponents),
    ) else {
        debug!("SIP forward fit singular; keeping linear WCS");
        return wcs.clone();
    };
    // Inverse terms are fit on the ideal linear coordinates.
    let du_inv: Vec<f64> = du.iter().map(|d| -d).collect();
    let dv_inv: Vec<f64> = dv.iter().map(|d| -d).collect();
    let (Some(ap), Some(bp)) = (
        fit_poly(&capital_uv, &du_inv, &exponents),
        fit_poly(&capital_uv, &dv_inv, &exponents),
    ) else {
        debug!("SIP inverse fit singular; keeping linear WCS");
        return wcs.clone();
    };

    SipWcs {
        sip: Some(SipTerms {
            order,
            a: pack_coefficients(order, &exponents, &a),
            b: pack_coefficients(order, &exponents, &b),
            ap: pack_coefficients(order, &exponents, &ap),
            bp: pack_coefficients(order, &exponents, &bp),
        }),
        ..wcs.clone()
    }
}
