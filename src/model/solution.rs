use serde::{Deserialize, Serialize};

use crate::domain::wcs::SipWcs;
use crate::model::params::Parity;

/// Result of a successful plate solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    /// Field width and height, arcminutes.
    pub field_width: f64,
    pub field_height: f64,
    /// Field center.
    pub ra: f64,
    pub dec: f64,
    pub ra_str: String,
    pub dec_str: String,
    /// Rotation of the field: up is this many degrees east of north.
    pub orientation: f64,
    /// Arcseconds per pixel, referred to the full-resolution image.
    pub pixscale: f64,
    pub parity: Parity,
    /// Offset from the search position, arcseconds; 0 without a hint.
    pub ra_error: f64,
    pub dec_error: f64,
    /// Log-odds score of the winning match.
    pub logodds: f64,
    /// Reference stars matched by the verifier.
    pub num_matches: usize,
    /// Id of the index that produced the match.
    pub index_id: u32,
    /// Full WCS, in working (possibly downsampled) pixel coordinates.
    pub wcs: SipWcs,
}

/// Format a right ascension in degrees as `HHhMMmSS.SSs`.
pub fn ra_to_hms_string(ra_deg: f64) -> String {
    let mut ra = ra_deg % 360.0;
    if ra < 0.0 {
        ra += 360.0;
    }
    let ra_h = ra / 15.0;
    let h = ra_h.floor() as u32;
    let m = ((ra_h - h as f64) * 60.0).floor() as u32;
    let s = (ra_h - h as f64) * 3600.0 - m as f64 * 60.0;
    format!("{:02}h{:02}m{:05.2}s", h, m, s)
}

/// Format a declination in degrees as `±DD°MM'SS.S"`.
pub fn dec_to_dms_string(dec_deg: f64) -> String {
    let sign = if dec_deg >= 0.0 { "+" } else { "-" };
    let dec = dec_deg.abs();
    let d = dec.floor() as u32;
    let m = ((dec - d as f64) * 60.0).floor() as u32;
    let s = (dec - d as f64) * 3600.0 - m as f64 * 60.0;
    format!("{}{:02}\u{00b0}{:02}'{:04.1}\"", sign, d, m, s)
}
