//! Depth-ladder orchestration: quad enumeration, candidate matching,
//! verification, tweak, and the child-solver fan-out.
//!
//! In parallel mode the depth ladder is split round-robin across child
//! solver threads sharing one cancel token, one best-match slot, and the
//! job's solved sentinel; the first child to cross `logratio_tosolve`
//! wins and the siblings stop at their next boundary check. The solver
//! returns the first match to cross the threshold, so parallel runs may
//! legitimately pick any of several above-threshold matches.

use std::sync::Mutex;

use log::{debug, info};

use crate::domain::index::IndexCatalog;
use crate::domain::matcher::{find_candidates, QuadMatch};
use crate::domain::quads::enumerate_quads;
use crate::domain::tweak::{tweak_wcs, DEFAULT_SIP_ORDER};
use crate::domain::verify::{
    default_bail_threshold, score_wcs, verify_candidate, TrialMatch, VerifyContext,
};
use crate::error::{Error, Result};
use crate::model::{Parameters, PositionHint};
use crate::utils::cancel::{CancelToken, Deadline, JobSentinels};

/// Quads shorter than this many pixels carry too little geometry.
const MIN_QUAD_PIXELS: f64 = 10.0;

/// Lifecycle of one solve job. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStage {
    New,
    Extracting,
    Filtering,
    Solving,
    Tweaking,
    Solved,
    Failed,
    Aborted,
    TimedOut,
}

impl SolveStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SolveStage::Solved | SolveStage::Failed | SolveStage::Aborted | SolveStage::TimedOut
        )
    }
}

/// Shared, sticky stage slot observed by the engine and its callers.
pub struct StageTracker(Mutex<SolveStage>);

impl Default for StageTracker {
    fn default() -> Self {
        StageTracker(Mutex::new(SolveStage::New))
    }
}

impl StageTracker {
    pub fn get(&self) -> SolveStage {
        *self.0.lock().unwrap()
    }

    /// Advance the stage; once terminal, further transitions are ignored.
    pub fn set(&self, next: SolveStage) {
        let mut stage = self.0.lock().unwrap();
        if !stage.is_terminal() {
            *stage = next;
        }
    }
}

/// One solve attempt over an already extracted and filtered star list.
pub struct SolverJob<'a> {
    /// 1-based pixel positions, brightest first.
    pub positions: Vec<(f64, f64)>,
    /// Working image dimensions (after any downsampling).
    pub width: f64,
    pub height: f64,
    /// Trial scale band, arcsec per working pixel.
    pub pixscale_band: (f64, f64),
    pub params: &'a Parameters,
    pub catalog: &'a IndexCatalog,
    pub position_hint: Option<PositionHint>,
    pub cancel: CancelToken,
    pub sentinels: &'a JobSentinels,
    pub deadline: Deadline,
    pub stage: &'a StageTracker,
}

fn depth_ladder(in_parallel: bool) -> Vec<(usize, usize)> {
    let mut ladder: Vec<(usize, usize)> = (0..20).map(|i| (i * 10, (i + 1) * 10)).collect();
    if in_parallel {
        // The {0,0} "no depth limit" sentinel of the configuration maps to
        // an unbounded tail range; without parallel children the ladder
        // stays at the bounded default.
        ladder.push((200, usize::MAX));
    }
    ladder
}

struct Shared<'a> {
    job: &'a SolverJob<'a>,
    best: Mutex<Option<TrialMatch>>,
    tosolve: f64,
    tokeep: f64,
    totune: f64,
}

impl Shared<'_> {
    fn should_stop(&self) -> bool {
        self.job.cancel.is_cancelled()
            || self.job.deadline.expired()
            || self.job.sentinels.is_solved()
    }

    /// Record a trial that reached at least `tokeep`; returns true when it
    /// crossed the solve threshold and the job is done.
    fn record(&self, trial: TrialMatch) -> bool {
        let solved = trial.logodds >= self.tosolve;
        let mut best = self.best.lock().unwrap();
        let better = best.as_ref().map(|b| trial.logodds > b.logodds).unwrap_or(true);
        if better {
            info!(
                "keeping match: logodds {:.1}, {} matches, index {}",
                trial.logodds, trial.num_matches, trial.index_id
            );
            *best = Some(trial);
        }
        drop(best);
        if solved {
            // First above-threshold hit wins; siblings observe the
            // sentinel at their next boundary.
            self.job.sentinels.mark_solved();
        }
        solved
    }
}

fn worker(shared: &Shared<'_>, ranges: &[(usize, usize)]) {
    let job = shared.job;
    let diagonal = (job.width * job.width + job.height * job.height).sqrt();
    let min_quad_arcsec = MIN_QUAD_PIXELS * job.pixscale_band.0;
    let max_quad_arcsec = diagonal * job.pixscale_band.1;
    let indexes = job.catalog.in_band(min_quad_arcsec, max_quad_arcsec);
    if indexes.is_empty() {
        debug!(
            "no index covers quad sizes {:.0}-{:.0} arcsec",
            min_quad_arcsec, max_quad_arcsec
        );
        return;
    }

    // Pixel-length bounds on the quad backbone across all usable indexes.
    let min_ab = indexes
        .iter()
        .map(|i| i.scale_lo / job.pixscale_band.1)
        .fold(f64::MAX, f64::min)
        .max(MIN_QUAD_PIXELS);
    let max_ab = indexes
        .iter()
        .map(|i| i.scale_hi / job.pixscale_band.0)
        .fold(0.0f64, f64::max)
        .min(diagonal);

    let ctx = VerifyContext {
        field_stars: &job.positions,
        width: job.width,
        height: job.height,
        pixscale_band: job.pixscale_band,
        search_parity: job.params.search_parity,
        position: job
            .position_hint
            .map(|hint| (hint, job.params.search_radius_deg)),
        bail_threshold: default_bail_threshold(),
    };

    let mut candidates: Vec<QuadMatch> = Vec::new();

    for &(depth_lo, depth_hi) in ranges {
        // Depth boundary: consult the sentinel files as well.
        if shared.should_stop()
            || job.cancel.check_sentinel()
            || job.sentinels.check_solved_sentinel()
        {
            return;
        }
        debug!(
            "solving depth {}..{} over {} stars",
            depth_lo,
            depth_hi.min(job.positions.len()),
            job.positions.len()
        );

        enumerate_quads(
            &job.positions,
            depth_lo,
            depth_hi,
            min_ab,
            max_ab,
            &mut || !shared.should_stop(),
            &mut |quad| {
                candidates.clear();
                for index in &indexes {
                    find_candidates(
                        &quad,
                        index,
                        job.params.search_parity,
                        job.pixscale_band,
                        &mut candidates,
                    );
                }
                for candidate in &candidates {
                    // Suspension point before every verification.
                    if shared.should_stop() {
                        return false;
                    }
                    let Some(mut trial) = verify_candidate(candidate, &ctx) else {
                        continue;
                    };

                    if trial.logodds >= shared.totune && trial.logodds < shared.tosolve {
                        // Good but not convincing: refine and re-score.
                        job.stage.set(SolveStage::Tweaking);
                        let tweaked =
                            tweak_wcs(&trial.wcs, &trial.correspondences, DEFAULT_SIP_ORDER);
                        job.stage.set(SolveStage::Solving);
                        if let Some((logodds, correspondences)) =
                            score_wcs(&tweaked, &candidate.index, &ctx)
                        {
                            if logodds > trial.logodds {
                                debug!(
                                    "tweak raised logodds {:.1} -> {:.1}",
                                    trial.logodds, logodds
                                );
                                trial = TrialMatch {
                                    wcs: tweaked,
                                    logodds,
                                    num_matches: correspondences.len(),
                                    index_id: trial.index_id,
                                    correspondences,
                                };
                            }
                        }
                    }

                    if trial.logodds >= shared.tokeep && shared.record(trial) {
                        return false;
                    }
                }
                true
            },
        );
    }
}

/// Run the full ladder. Returns the winning match, or the error that best
/// describes why there is none.
pub fn run(job: &SolverJob<'_>) -> Result<TrialMatch> {
    if job.positions.len() < 4 {
        return Err(Error::ExtractionFailed(format!(
            "only {} stars available; at least 4 are needed to form quads",
            job.positions.len()
        )));
    }
    if !(job.pixscale_band.0 > 0.0 && job.pixscale_band.1 >= job.pixscale_band.0) {
        return Err(Error::InvalidInput(format!(
            "nonsensical scale band {:?} arcsec/pixel",
            job.pixscale_band
        )));
    }

    // Keeping is a precondition of solving.
    let tosolve = job.params.logratio_tosolve;
    let shared = Shared {
        job,
        best: Mutex::new(None),
        tosolve,
        tokeep: job.params.logratio_tokeep.min(tosolve),
        totune: job.params.logratio_totune,
    };

    let ladder = depth_ladder(job.params.in_parallel);
    let num_children = if job.params.in_parallel {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(ladder.len())
    } else {
        1
    };

    if num_children <= 1 {
        worker(&shared, &ladder);
    } else {
        info!("solving with {} child solvers", num_children);
        let assignments: Vec<Vec<(usize, usize)>> = (0..num_children)
            .map(|child| ladder.iter().copied().skip(child).step_by(num_children).collect())
            .collect();
        let shared_ref = &shared;
        std::thread::scope(|scope| {
            for ranges in &assignments {
                scope.spawn(move || worker(shared_ref, ranges));
            }
        });
    }

    let best = shared.best.lock().unwrap().take();
    let cancelled = job.cancel.is_cancelled();
    let timed_out = job.deadline.expired();

    match best {
        Some(trial) if trial.logodds >= tosolve => Ok(trial),
        // A kept near-miss survives an interrupted ladder.
        Some(trial) if (cancelled || timed_out) && trial.logodds >= shared.tokeep => Ok(trial),
        _ if cancelled => Err(Error::Cancelled),
        _ if timed_out => Err(Error::TimedOut),
        _ => Err(Error::NoSolution),
    }
}
