//! The public engine handle: one pixel buffer, any number of extract and
//! solve jobs over it.
//!
//! The buffer is borrowed for the engine's lifetime; nothing is retained
//! past drop. Cancellation is shared through [`CancelToken`] clones so an
//! in-flight `extract` or `solve` can be aborted from another thread.

use std::path::PathBuf;
use std::time::Duration;

use log::info;

use crate::domain::solver::{self, SolveStage, SolverJob, StageTracker};
use crate::domain::wcs::SipWcs;
use crate::domain::{buffer, filter, index::IndexCatalog, partition};
use crate::error::{Error, Result};
use crate::model::solution::{dec_to_dms_string, ra_to_hms_string};
use crate::model::{
    Background, Parameters, PositionHint, ScaleHint, ScaleUnits, Solution, Star, Statistic,
    SubFrame,
};
use crate::utils::cancel::{CancelToken, Deadline, JobSentinels};

pub struct Engine<'a> {
    stats: Statistic,
    pixels: &'a [u8],
    params: Parameters,
    index_paths: Vec<PathBuf>,
    scale_hint: Option<ScaleHint>,
    position_hint: Option<PositionHint>,
    sub_frame: Option<SubFrame>,
    cancel: CancelToken,
    stage: StageTracker,
    stars: Vec<Star>,
    background: Background,
    has_extracted: bool,
    solution: Option<Solution>,
    /// Downsampling factor behind the stored WCS.
    solved_downsample: u32,
}

impl<'a> Engine<'a> {
    pub fn new(stats: Statistic, pixels: &'a [u8]) -> Result<Engine<'a>> {
        if stats.width == 0 || stats.height == 0 {
            return Err(Error::InvalidInput("image has zero dimensions".into()));
        }
        if stats.channels != 1 && stats.channels != 3 {
            return Err(Error::InvalidInput(format!(
                "unsupported channel count {}",
                stats.channels
            )));
        }
        if stats.bytes_per_pixel != stats.sample_type.bytes_per_pixel() {
            return Err(Error::InvalidInput(format!(
                "bytes_per_pixel {} does not match sample type {:?}",
                stats.bytes_per_pixel, stats.sample_type
            )));
        }
        if stats.expected_buffer_len() != pixels.len() {
            return Err(Error::InvalidInput(format!(
                "buffer is {} bytes, expected {} for {}x{}x{}",
                pixels.len(),
                stats.expected_buffer_len(),
                stats.width,
                stats.height,
                stats.channels
            )));
        }
        Ok(Engine {
            stats,
            pixels,
            params: Parameters::default(),
            index_paths: Vec::new(),
            scale_hint: None,
            position_hint: None,
            sub_frame: None,
            cancel: CancelToken::new(),
            stage: StageTracker::default(),
            stars: Vec::new(),
            background: Background::default(),
            has_extracted: false,
            solution: None,
            solved_downsample: 1,
        })
    }

    pub fn set_parameters(&mut self, params: Parameters) {
        self.params = params;
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub fn set_index_paths(&mut self, paths: Vec<PathBuf>) {
        self.index_paths = paths;
    }

    pub fn set_scale_hint(&mut self, lo: f64, hi: f64, units: ScaleUnits) {
        self.scale_hint = Some(ScaleHint { lo, hi, units });
    }

    pub fn set_position_hint(&mut self, ra_deg: f64, dec_deg: f64) {
        self.position_hint = Some(PositionHint { ra_deg, dec_deg });
    }

    pub fn set_sub_frame(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<()> {
        let frame = SubFrame { x, y, width, height };
        if !frame.fits_within(&self.stats) {
            return Err(Error::InvalidInput(format!(
                "sub-frame {}x{}+{}+{} exceeds the {}x{} image",
                width, height, x, y, self.stats.width, self.stats.height
            )));
        }
        self.sub_frame = Some(frame);
        Ok(())
    }

    pub fn is_using_scale(&self) -> bool {
        self.scale_hint.is_some()
    }

    pub fn is_using_position(&self) -> bool {
        self.position_hint.is_some()
    }

    /// Cancel the in-flight extract or solve. For cross-thread use take an
    /// [`abort_handle`](Engine::abort_handle) clone before starting the job.
    pub fn abort(&self) {
        info!("aborting");
        self.cancel.cancel();
    }

    pub fn abort_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn stage(&self) -> SolveStage {
        self.stage.get()
    }

    pub fn num_stars_found(&self) -> usize {
        self.stars.len()
    }

    pub fn star_list(&self) -> &[Star] {
        &self.stars
    }

    pub fn background(&self) -> &Background {
        &self.background
    }

    pub fn has_extracted(&self) -> bool {
        self.has_extracted
    }

    pub fn has_solved(&self) -> bool {
        self.solution.is_some()
    }

    pub fn solution(&self) -> Option<&Solution> {
        self.solution.as_ref()
    }

    fn working_region(&self) -> SubFrame {
        self.sub_frame.unwrap_or_else(|| SubFrame::full(&self.stats))
    }

    fn check_params(&self) -> Result<()> {
        if self.params.conv_filter_side().is_none() {
            return Err(Error::InvalidInput(
                "conv_filter must be a non-empty odd-sided square kernel".into(),
            ));
        }
        Ok(())
    }

    /// Detect stars over the (sub-)frame at full resolution.
    pub fn extract(&mut self, compute_hfr: bool) -> Result<&[Star]> {
        self.check_params()?;
        if self.cancel.is_cancelled() {
            self.stage.set(SolveStage::Aborted);
            return Err(Error::Cancelled);
        }
        self.stage.set(SolveStage::Extracting);

        let region = self.working_region();
        let outcome = partition::extract_region(
            &self.stats,
            self.pixels,
            region,
            &self.params,
            compute_hfr,
            &self.cancel,
        );
        let (mut stars, background) = match outcome {
            Ok(r) => r,
            Err(e) => {
                self.stage.set(match e {
                    Error::Cancelled => SolveStage::Aborted,
                    _ => SolveStage::Failed,
                });
                return Err(e);
            }
        };

        self.stage.set(SolveStage::Filtering);
        filter::apply_star_filters(&mut stars, &self.params, self.stats.sample_type);

        self.stars = stars;
        self.background = background;
        self.has_extracted = true;
        Ok(&self.stars)
    }

    /// Trial scale band in arcsec per working pixel.
    fn pixscale_band(&self, working: SubFrame, downsample: u32) -> Result<(f64, f64)> {
        let band = match self.scale_hint {
            Some(hint) => match hint.units {
                // An arcsec-per-pixel hint refers to full-resolution pixels.
                ScaleUnits::ArcsecPerPix => {
                    (hint.lo * downsample as f64, hint.hi * downsample as f64)
                }
                _ => hint.to_arcsec_per_pixel(working.width),
            },
            None => {
                if self.params.min_width_deg <= 0.0
                    || self.params.max_width_deg <= 0.0
                    || self.params.min_width_deg > self.params.max_width_deg
                {
                    return Err(Error::InvalidInput(format!(
                        "min_width_deg/max_width_deg {}..{} must be positive and ordered",
                        self.params.min_width_deg, self.params.max_width_deg
                    )));
                }
                let lo = self.params.min_width_deg * 3600.0 / working.width as f64;
                let hi = self.params.max_width_deg * 3600.0 / working.height as f64;
                (lo.min(hi), lo.max(hi))
            }
        };
        if !(band.0 > 0.0 && band.1 >= band.0) {
            return Err(Error::InvalidInput(format!(
                "nonsensical scale band {:.4}..{:.4} arcsec/pixel",
                band.0, band.1
            )));
        }
        Ok(band)
    }

    /// Extraction pass used when `solve` runs before `extract`: the image
    /// is optionally downsampled first, and HFR is skipped.
    fn extract_for_solving(&mut self) -> Result<(Vec<Star>, SubFrame, u32)> {
        let d = self.params.downsample.max(1);
        self.stage.set(SolveStage::Extracting);
        let (stats, owned, region) = if d > 1 {
            let (dstats, dbuf) = buffer::downsample(&self.stats, self.pixels, d)
                .map_err(|e| Error::InvalidInput(format!("{:#}", e)))?;
            let region = match self.sub_frame {
                Some(f) => {
                    let frame = SubFrame {
                        x: f.x / d,
                        y: f.y / d,
                        width: (f.width / d).max(1),
                        height: (f.height / d).max(1),
                    };
                    if !frame.fits_within(&dstats) {
                        return Err(Error::InvalidInput(format!(
                            "sub-frame does not survive downsampling by {}",
                            d
                        )));
                    }
                    frame
                }
                None => SubFrame::full(&dstats),
            };
            (dstats, Some(dbuf), region)
        } else {
            (self.stats.clone(), None, self.working_region())
        };

        let pixels: &[u8] = owned.as_deref().unwrap_or(self.pixels);
        let (mut stars, background) =
            partition::extract_region(&stats, pixels, region, &self.params, false, &self.cancel)?;
        self.stage.set(SolveStage::Filtering);
        filter::apply_star_filters(&mut stars, &self.params, stats.sample_type);
        self.background = background;
        Ok((stars, region, d))
    }

    /// Plate-solve the field. Reuses a prior `extract` star list when one
    /// exists, otherwise extracts internally (honoring `downsample`).
    pub fn solve(&mut self) -> Result<Solution> {
        self.check_params()?;
        // One wall-clock deadline per job, covering index loading and the
        // internal extraction as well as the ladder itself.
        let limit = self.params.solver_time_limit_sec;
        let deadline = Deadline::after(if limit > 0 {
            Some(Duration::from_secs(limit))
        } else {
            None
        });

        if self.index_paths.is_empty() {
            self.stage.set(SolveStage::Failed);
            return Err(Error::NoIndexes);
        }
        let catalog = match IndexCatalog::load_paths(&self.index_paths) {
            Ok(c) => c,
            Err(e) => {
                self.stage.set(SolveStage::Failed);
                return Err(e);
            }
        };

        let result = self.solve_with_catalog(&catalog, deadline);
        match &result {
            Ok(_) => self.stage.set(SolveStage::Solved),
            Err(Error::Cancelled) => self.stage.set(SolveStage::Aborted),
            Err(Error::TimedOut) => self.stage.set(SolveStage::TimedOut),
            Err(_) => self.stage.set(SolveStage::Failed),
        }
        result
    }

    fn solve_with_catalog(&mut self, catalog: &IndexCatalog, deadline: Deadline) -> Result<Solution> {
        let (stars, region, downsample) = if self.has_extracted {
            (self.stars.clone(), self.working_region(), 1)
        } else {
            self.extract_for_solving()?
        };
        if deadline.expired() {
            return Err(Error::TimedOut);
        }
        let (working_w, working_h) = (region.width, region.height);

        // The depth ladder walks the list brightest-first. Positions are
        // normalized to the working region; CRPIX is shifted back after
        // the solve so the WCS applies in image coordinates.
        let origin = (region.x as f64, region.y as f64);
        let mut by_mag = stars;
        by_mag.sort_by(|s1, s2| s1.mag.partial_cmp(&s2.mag).unwrap_or(std::cmp::Ordering::Equal));
        let positions: Vec<(f64, f64)> = by_mag
            .iter()
            .map(|s| (s.x as f64 - origin.0, s.y as f64 - origin.1))
            .collect();

        let band = self.pixscale_band(region, downsample)?;
        info!(
            "solving {} stars, scale band {:.2}-{:.2} arcsec/pixel, {} indexes",
            positions.len(),
            band.0,
            band.1,
            catalog.indexes.len()
        );

        // Per-job sentinel directory; both markers are cleaned on exit.
        let job_dir = tempfile::Builder::new()
            .prefix("starsolve-job-")
            .tempdir()
            .map_err(|e| Error::Internal(format!("cannot create job dir: {}", e)))?;
        let sentinels = JobSentinels::create_in(job_dir.path())
            .map_err(|e| Error::Internal(format!("{:#}", e)))?;
        self.cancel.bind_file(sentinels.cancel_path().to_path_buf());

        self.stage.set(SolveStage::Solving);
        let outcome = {
            let job = SolverJob {
                positions,
                width: working_w as f64,
                height: working_h as f64,
                pixscale_band: band,
                params: &self.params,
                catalog,
                position_hint: self.position_hint,
                cancel: self.cancel.clone(),
                sentinels: &sentinels,
                deadline,
                stage: &self.stage,
            };
            solver::run(&job)
        };
        sentinels.cleanup();
        self.cancel.unbind_file();

        let trial = outcome?;
        let mut wcs = trial.wcs;
        wcs.crpix1 += origin.0;
        wcs.crpix2 += origin.1;
        let (cx, cy) = (
            origin.0 + (working_w as f64 + 1.0) / 2.0,
            origin.1 + (working_h as f64 + 1.0) / 2.0,
        );
        let (ra, dec) = wcs.pixel_to_world(cx, cy);
        let (field_width, field_height) =
            wcs.field_size_arcmin(working_w as f64, working_h as f64);
        let pixscale = wcs.pixel_scale_arcsec() / downsample as f64;
        let (ra_error, dec_error) = match self.position_hint {
            Some(hint) => ((hint.ra_deg - ra) * 3600.0, (hint.dec_deg - dec) * 3600.0),
            None => (0.0, 0.0),
        };

        let solution = Solution {
            field_width,
            field_height,
            ra,
            dec,
            ra_str: ra_to_hms_string(ra),
            dec_str: dec_to_dms_string(dec),
            orientation: wcs.orientation_deg(cx, cy),
            pixscale,
            parity: wcs.parity(),
            ra_error,
            dec_error,
            logodds: trial.logodds,
            num_matches: trial.num_matches,
            index_id: trial.index_id,
            wcs,
        };
        info!(
            "field center ({:.4}, {:.4}) deg, {} x {} arcmin, {:.2} arcsec/pixel, parity {}",
            solution.ra,
            solution.dec,
            solution.field_width.round(),
            solution.field_height.round(),
            solution.pixscale,
            solution.parity
        );

        self.solved_downsample = downsample;
        self.solution = Some(solution.clone());
        Ok(solution)
    }

    fn wcs(&self) -> Result<&SipWcs> {
        self.solution
            .as_ref()
            .map(|s| &s.wcs)
            .ok_or_else(|| Error::InvalidInput("no WCS data; solve the field first".into()))
    }

    /// Full-resolution pixel to sky. Coordinates are 1-based.
    pub fn pixel_to_sky(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let d = self.solved_downsample as f64;
        Ok(self.wcs()?.pixel_to_world(x / d, y / d))
    }

    /// Sky to full-resolution pixel.
    pub fn sky_to_pixel(&self, ra: f64, dec: f64) -> Result<(f64, f64)> {
        let d = self.solved_downsample as f64;
        let (x, y) = self
            .wcs()?
            .world_to_pixel(ra, dec)
            .ok_or_else(|| Error::InvalidInput("position is behind the tangent plane".into()))?;
        Ok((x * d, y * d))
    }

    /// Decorate a star list with RA/Dec through the solved WCS.
    pub fn annotate_stars(&self, stars: &mut [Star]) -> Result<()> {
        let wcs = self.wcs()?;
        let d = self.solved_downsample as f64;
        for star in stars.iter_mut() {
            let (ra, dec) = wcs.pixel_to_world(star.x as f64 / d, star.y as f64 / d);
            star.ra = ra;
            star.dec = dec;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SampleType;

    #[test]
    fn test_new_validates_buffer_length() {
        let stats = Statistic::new(16, 16, 1, SampleType::U16);
        let short = vec![0u8; 100];
        assert!(matches!(
            Engine::new(stats.clone(), &short),
            Err(Error::InvalidInput(_))
        ));
        let right = vec![0u8; 16 * 16 * 2];
        assert!(Engine::new(stats, &right).is_ok());
    }

    #[test]
    fn test_new_rejects_zero_dims() {
        let stats = Statistic::new(0, 16, 1, SampleType::U8);
        assert!(Engine::new(stats, &[]).is_err());
    }

    #[test]
    fn test_sub_frame_validation() {
        let stats = Statistic::new(64, 64, 1, SampleType::U8);
        let buf = vec![0u8; 64 * 64];
        let mut engine = Engine::new(stats, &buf).unwrap();
        assert!(engine.set_sub_frame(0, 0, 64, 64).is_ok());
        assert!(engine.set_sub_frame(32, 32, 33, 32).is_err());
    }

    #[test]
    fn test_solve_without_indexes() {
        let stats = Statistic::new(32, 32, 1, SampleType::U8);
        let buf = vec![0u8; 32 * 32];
        let mut engine = Engine::new(stats, &buf).unwrap();
        assert!(matches!(engine.solve(), Err(Error::NoIndexes)));
        assert_eq!(engine.stage(), SolveStage::Failed);
    }

    #[test]
    fn test_wcs_queries_require_solution() {
        let stats = Statistic::new(32, 32, 1, SampleType::U8);
        let buf = vec![0u8; 32 * 32];
        let engine = Engine::new(stats, &buf).unwrap();
        assert!(engine.pixel_to_sky(10.0, 10.0).is_err());
        assert!(engine.sky_to_pixel(180.0, 0.0).is_err());
    }

    #[test]
    fn test_empty_conv_filter_is_invalid_input() {
        let stats = Statistic::new(32, 32, 1, SampleType::U8);
        let buf = vec![0u8; 32 * 32];
        let mut engine = Engine::new(stats, &buf).unwrap();
        let mut params = Parameters::default();
        params.conv_filter.clear();
        engine.set_parameters(params);
        assert!(matches!(engine.extract(false), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_abort_before_extract() {
        let stats = Statistic::new(32, 32, 1, SampleType::U8);
        let buf = vec![0u8; 32 * 32];
        let mut engine = Engine::new(stats, &buf).unwrap();
        engine.abort();
        assert!(matches!(engine.extract(false), Err(Error::Cancelled)));
        assert_eq!(engine.stage(), SolveStage::Aborted);
    }
}
