use serde::{Deserialize, Serialize};

pub const DEG_TO_ARCSEC: f64 = 3600.0;

/// Aperture used for the photometric flux sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApertureShape {
    /// Kron ellipse, falling back to an `r_min` circle for tiny sources.
    Auto,
    /// Fixed circle of radius `r_min`.
    Circle,
    /// Always the Kron ellipse.
    Ellipse,
}

/// Image parity relative to the sky: positive means the CD matrix
/// determinant is negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    Positive,
    Negative,
    Both,
}

impl std::fmt::Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Parity::Positive => write!(f, "pos"),
            Parity::Negative => write!(f, "neg"),
            Parity::Both => write!(f, "both"),
        }
    }
}

/// Units of a field-scale hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleUnits {
    DegWidth,
    ArcminWidth,
    ArcsecPerPix,
    FocalMm,
}

/// Caller-supplied estimate of the field scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScaleHint {
    pub lo: f64,
    pub hi: f64,
    pub units: ScaleUnits,
}

impl ScaleHint {
    /// Convert to an arcsec-per-pixel band for an image of the given width.
    pub fn to_arcsec_per_pixel(&self, image_width: u32) -> (f64, f64) {
        let w = image_width.max(1) as f64;
        let (lo, hi) = match self.units {
            ScaleUnits::DegWidth => (self.lo * DEG_TO_ARCSEC / w, self.hi * DEG_TO_ARCSEC / w),
            ScaleUnits::ArcminWidth => (self.lo * 60.0 / w, self.hi * 60.0 / w),
            ScaleUnits::ArcsecPerPix => (self.lo, self.hi),
            ScaleUnits::FocalMm => {
                // "35 mm" film is 36 mm wide.
                let app = |focal: f64| (36.0 / (2.0 * focal)).atan().to_degrees() * DEG_TO_ARCSEC / w;
                (app(self.hi), app(self.lo))
            }
        };
        (lo.min(hi), lo.max(hi))
    }
}

/// Caller-supplied estimate of the field center. The search radius comes
/// from `Parameters::search_radius_deg`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionHint {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

/// Full configuration bundle for extraction and solving.
///
/// A value of this struct travels with each job; the engine holds no
/// process-wide mutable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    /// Name of this profile of options.
    pub profile_name: String,

    // Aperture photometry
    pub aperture_shape: ApertureShape,
    /// Scale factor applied to the Kron radius for the elliptical aperture.
    pub kron_fact: f64,
    /// Sub-pixel sampling factor for aperture boundary pixels.
    pub subpix: u32,
    /// Minimum circular aperture radius, pixels.
    pub r_min: f64,
    /// Edge/mask treatment flags, passed through to the aperture sums.
    pub inflags: u16,

    // Detection
    pub magzero: f64,
    /// Minimum pixel count for a detection.
    pub minarea: usize,
    /// Number of intensity levels for deblending.
    pub deblend_thresh: u32,
    /// Minimum flux fraction a sub-peak needs to split off. 1.0 disables
    /// deblending.
    pub deblend_contrast: f64,
    pub clean: bool,
    pub clean_param: f64,
    /// FWHM last used to generate `conv_filter`. Changing it does not
    /// regenerate the kernel; use `set_conv_filter_from_fwhm`.
    pub fwhm: f64,
    /// Odd-sided square convolution kernel, row-major.
    pub conv_filter: Vec<f32>,

    // Star filtering
    pub max_size: f64,
    pub min_size: f64,
    pub max_ellipse: f64,
    pub remove_brightest_pct: f64,
    pub remove_dimmest_pct: f64,
    pub saturation_limit_pct: f64,
    /// Keep only this many stars after filtering; 0 keeps all.
    pub keep_num: usize,
    /// Cap on detections per tile, applied before filtering.
    pub initial_keep: usize,
    /// Sort by magnitude before filtering. Required for the percentile
    /// and keep-count filters to be meaningful.
    pub resort: bool,

    // Solver
    pub in_parallel: bool,
    pub solver_time_limit_sec: u64,
    /// Bounds on the field width when no scale hint is given, degrees.
    pub min_width_deg: f64,
    pub max_width_deg: f64,
    /// Integer downsampling factor applied before extraction-for-solving.
    pub downsample: u32,
    pub search_parity: Parity,
    pub search_radius_deg: f64,

    // Log-odds thresholds
    pub logratio_tosolve: f64,
    pub logratio_tokeep: f64,
    pub logratio_totune: f64,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            profile_name: "Default".into(),
            aperture_shape: ApertureShape::Circle,
            kron_fact: 2.5,
            subpix: 5,
            r_min: 3.5,
            inflags: 0,
            magzero: 20.0,
            minarea: 5,
            deblend_thresh: 32,
            deblend_contrast: 1.0,
            clean: true,
            clean_param: 1.0,
            fwhm: 2.0,
            conv_filter: vec![
                0.260856, 0.483068, 0.260856,
                0.483068, 0.894573, 0.483068,
                0.260856, 0.483068, 0.260856,
            ],
            max_size: 0.0,
            min_size: 0.0,
            max_ellipse: 0.0,
            remove_brightest_pct: 0.0,
            remove_dimmest_pct: 0.0,
            saturation_limit_pct: 0.0,
            keep_num: 0,
            initial_keep: usize::MAX,
            resort: true,
            in_parallel: true,
            solver_time_limit_sec: 600,
            min_width_deg: 0.1,
            max_width_deg: 180.0,
            downsample: 1,
            search_parity: Parity::Both,
            search_radius_deg: 15.0,
            logratio_tosolve: 1e9f64.ln(),
            logratio_tokeep: 1e9f64.ln(),
            logratio_totune: 1e6f64.ln(),
        }
    }
}

impl Parameters {
    /// Profile tuned for solving speed: small stars are ignored and only
    /// the brightest detections are kept for quad building.
    pub fn fast_solving() -> Self {
        Parameters {
            profile_name: "FastSolving".into(),
            keep_num: 50,
            initial_keep: 500,
            max_ellipse: 1.5,
            ..Parameters::default()
        }
    }

    /// Profile for very large images solved with parallel child solvers.
    pub fn parallel_large_scale() -> Self {
        Parameters {
            profile_name: "ParallelLargeScale".into(),
            downsample: 2,
            keep_num: 200,
            initial_keep: 1000,
            ..Parameters::default()
        }
    }

    /// Profile for complete extraction: every detection survives, with
    /// photometry over Kron ellipses.
    pub fn all_stars() -> Self {
        Parameters {
            profile_name: "AllStars".into(),
            aperture_shape: ApertureShape::Auto,
            deblend_contrast: 0.005,
            resort: false,
            ..Parameters::default()
        }
    }

    /// Replace `conv_filter` with a Gaussian matched filter for the given
    /// FWHM. Kernel side is `2*ceil(2*sigma) + 1`, always odd.
    pub fn set_conv_filter_from_fwhm(&mut self, fwhm: f64) {
        let sigma = (fwhm.max(0.1)) / (2.0 * (2.0f64.ln() * 2.0).sqrt());
        let half = (2.0 * sigma).ceil() as i32;
        let side = 2 * half + 1;
        let mut kernel = Vec::with_capacity((side * side) as usize);
        for y in -half..=half {
            for x in -half..=half {
                let r2 = (x * x + y * y) as f64;
                kernel.push((-r2 / (2.0 * sigma * sigma)).exp() as f32);
            }
        }
        self.fwhm = fwhm;
        self.conv_filter = kernel;
    }

    /// Side length of the convolution kernel, or None when the kernel is
    /// not an odd-sided square.
    pub fn conv_filter_side(&self) -> Option<usize> {
        let n = self.conv_filter.len();
        if n == 0 {
            return None;
        }
        let side = (n as f64).sqrt().round() as usize;
        if side * side == n && side % 2 == 1 { Some(side) } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_hint_deg_width() {
        let hint = ScaleHint { lo: 1.0, hi: 2.0, units: ScaleUnits::DegWidth };
        let (lo, hi) = hint.to_arcsec_per_pixel(3600);
        assert!((lo - 1.0).abs() < 1e-9);
        assert!((hi - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_scale_hint_arcsec_identity() {
        let hint = ScaleHint { lo: 0.5, hi: 1.5, units: ScaleUnits::ArcsecPerPix };
        assert_eq!(hint.to_arcsec_per_pixel(1234), (0.5, 1.5));
    }

    #[test]
    fn test_scale_hint_focal_inverts() {
        // Longer focal length means a smaller pixel scale, so the band
        // endpoints swap.
        let hint = ScaleHint { lo: 100.0, hi: 400.0, units: ScaleUnits::FocalMm };
        let (lo, hi) = hint.to_arcsec_per_pixel(1000);
        assert!(lo < hi);
        let wide = ScaleHint { lo: 100.0, hi: 100.0, units: ScaleUnits::FocalMm };
        let (w_lo, _) = wide.to_arcsec_per_pixel(1000);
        assert!((w_lo - hi).abs() < 1e-9);
    }

    #[test]
    fn test_conv_filter_from_fwhm() {
        let mut p = Parameters::default();
        p.set_conv_filter_from_fwhm(4.0);
        let side = p.conv_filter_side().unwrap();
        assert_eq!(side % 2, 1);
        assert_eq!(p.conv_filter.len(), side * side);
        // Center sample is the maximum.
        let center = p.conv_filter[(side * side) / 2];
        assert!(p.conv_filter.iter().all(|&v| v <= center));
    }

    #[test]
    fn test_default_kernel_is_square() {
        let p = Parameters::default();
        assert_eq!(p.conv_filter_side(), Some(3));
    }
}
