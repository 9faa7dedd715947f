//! Post-extraction star list filtering.
//!
//! The steps run in a fixed order; the percentile and keep-count trims
//! require the magnitude sort (`resort`) to be meaningful and are skipped
//! without it.

use log::{debug, info};

use crate::model::{Parameters, SampleType, Star};

pub fn apply_star_filters(stars: &mut Vec<Star>, params: &Parameters, sample_type: SampleType) {
    if stars.len() <= 1 {
        return;
    }
    info!("stars found before filtering: {}", stars.len());

    if params.resort {
        // A star is dimmer when its mag is greater; brightest first.
        stars.sort_by(|s1, s2| s1.mag.partial_cmp(&s2.mag).unwrap_or(std::cmp::Ordering::Equal));
    }

    if params.max_size > 0.0 {
        let max = params.max_size as f32;
        stars.retain(|s| s.a <= max && s.b <= max);
        debug!("{} stars after max_size {}", stars.len(), params.max_size);
    }

    if params.min_size > 0.0 {
        let min = params.min_size as f32;
        stars.retain(|s| s.a >= min && s.b >= min);
        debug!("{} stars after min_size {}", stars.len(), params.min_size);
    }

    // Both percentile trims are fractions of the list size entering them,
    // so 10% + 20% of 100 stars always leaves 70.
    let pct_base = stars.len() as f64;
    if params.resort && params.remove_brightest_pct > 0.0 && params.remove_brightest_pct < 100.0 {
        let num = (pct_base * params.remove_brightest_pct / 100.0) as usize;
        debug!("removing the {} brightest stars", num);
        stars.drain(..num.min(stars.len()));
    }

    if params.resort && params.remove_dimmest_pct > 0.0 && params.remove_dimmest_pct < 100.0 {
        let num = (pct_base * params.remove_dimmest_pct / 100.0) as usize;
        debug!("removing the {} dimmest stars", num);
        stars.truncate(stars.len() - num.min(stars.len()));
    }

    if params.max_ellipse > 1.0 {
        let max = params.max_ellipse as f32;
        stars.retain(|s| s.b == 0.0 || s.a / s.b <= max);
        debug!("{} stars after ellipticity limit {}", stars.len(), params.max_ellipse);
    }

    if params.saturation_limit_pct > 0.0 && params.saturation_limit_pct < 100.0 {
        match sample_type.max_value() {
            Some(type_max) => {
                let limit = (params.saturation_limit_pct / 100.0 * type_max) as f32;
                stars.retain(|s| s.peak <= limit);
                debug!("{} stars after saturation limit {}", stars.len(), limit);
            }
            None => {
                // Float data was usually rescaled upstream; its saturation
                // level is unknowable here.
                info!("skipping saturation filter for floating-point data");
            }
        }
    }

    if params.resort && params.keep_num > 0 {
        stars.truncate(params.keep_num);
        debug!("keeping the {} brightest stars", params.keep_num);
    }

    info!("stars found after filtering: {}", stars.len());
}
