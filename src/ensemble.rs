use crate::engine::{Engine, Outcome, OutcomeKind};
use crate::error::{SimError, SimResult};
use crate::model::RateModel;
use crate::observe::{OccupancySeries, SteadyProfile, SteadyState, TaggedParticle};
use crate::stats::{Accumulator, Summary};
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Trajectory that ended with an error and was left out of the averages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aborted {
    pub i_traj: usize,
    pub error: String,
}

/// Early-time statistics on a fixed time grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransientReport {
    pub times: Vec<f64>,
    /// Mean occupation number at each grid time, empty if no trajectory
    /// completed.
    pub occupation: Vec<f64>,
    /// Mean fraction of occupied sites at each grid time.
    pub density: Vec<f64>,
    /// Transit times of the tagged particles that left the lattice.
    pub transit_times: Vec<f64>,
    pub transit: Summary,
    /// Transit time of a particle with no traffic ahead.
    pub free_transit_time: f64,
    pub n_completed: usize,
    pub n_deadlocked: usize,
    pub aborted: Vec<Aborted>,
}

/// Time-averaged statistics collected after the steady-state onset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteadyReport {
    /// Mean density per site, empty if no trajectory became steady.
    pub density: Vec<f64>,
    /// Mean current per transition, empty if no trajectory became steady.
    pub current: Vec<f64>,
    pub onset: Summary,
    /// Trajectories that reached the steady state before the horizon.
    pub n_steady: usize,
    pub n_unsteady: usize,
    pub n_deadlocked: usize,
    pub aborted: Vec<Aborted>,
}

#[derive(Debug, Clone)]
pub struct TransientTrajectory {
    pub occupation: Vec<f64>,
    pub transit_time: Option<f64>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct SteadyTrajectory {
    pub profile: Option<SteadyProfile>,
    pub outcome: Outcome,
}

/// Runs independent trajectories of one rate model and merges them.
///
/// Trajectory `i_traj` draws from its own generator seeded from the base seed
/// and its index, so results only depend on the base seed and not on how
/// trajectories are scheduled over threads.
#[derive(Debug, Clone)]
pub struct Ensemble<'a> {
    model: &'a RateModel,
    n_traj: usize,
    seed: u64,
    n_threads: Option<usize>,
    audit_every: u64,
    max_events: Option<u64>,
}

impl<'a> Ensemble<'a> {
    pub fn new(model: &'a RateModel, n_traj: usize, seed: u64) -> SimResult<Self> {
        if n_traj == 0 {
            return Err(SimError::InvalidConfiguration(
                "number of trajectories must be at least 1".into(),
            ));
        }
        Ok(Self {
            model,
            n_traj,
            seed,
            n_threads: None,
            audit_every: 0,
            max_events: None,
        })
    }

    /// Run on a dedicated pool of `n_threads` threads.
    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = Some(n_threads);
        self
    }

    /// Audit lattice invariants every `audit_every` events of each trajectory.
    pub fn with_audit(mut self, audit_every: u64) -> Self {
        self.audit_every = audit_every;
        self
    }

    /// Cap every trajectory at `max_events` events.
    pub fn with_max_events(mut self, max_events: u64) -> Self {
        self.max_events = Some(max_events);
        self
    }

    /// Sample the occupation number on `n_bins` grid points over `horizon`
    /// and follow the first particle of every trajectory.
    pub fn run_transient(&self, horizon: f64, n_bins: usize) -> SimResult<TransientReport> {
        check_horizon(horizon)?;
        if n_bins == 0 {
            return Err(SimError::InvalidConfiguration(
                "number of bins must be at least 1".into(),
            ));
        }
        log::info!(
            "running {} transient trajectories (horizon {horizon}, {n_bins} bins)",
            self.n_traj
        );

        let results = self.run_trajectories(horizon, |engine| {
            let mut observer = (OccupancySeries::new(horizon, n_bins), TaggedParticle::new());
            let outcome = engine.run(&mut observer)?;
            let (series, tagged) = observer;
            Ok(TransientTrajectory {
                occupation: series.into_values(),
                transit_time: tagged.passage().map(|passage| passage.transit_time()),
                outcome,
            })
        })?;

        let times = OccupancySeries::new(horizon, n_bins).times();
        Ok(merge_transient(self.model, times, results))
    }

    /// Detect the steady state of every trajectory, then average density and
    /// current over the rest of it.
    pub fn run_steady(
        &self,
        horizon: f64,
        steps_per_check: u64,
        tolerance: f64,
    ) -> SimResult<SteadyReport> {
        check_horizon(horizon)?;
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            return Err(SimError::InvalidConfiguration(format!(
                "tolerance must be non-negative, but is {tolerance}"
            )));
        }
        log::info!(
            "running {} steady-state trajectories (horizon {horizon}, check every {steps_per_check} steps)",
            self.n_traj
        );

        let results = self.run_trajectories(horizon, |engine| {
            let mut steady = SteadyState::new(steps_per_check, tolerance);
            let outcome = engine.run(&mut steady)?;
            Ok(SteadyTrajectory {
                profile: steady.into_profile(),
                outcome,
            })
        })?;

        Ok(merge_steady(self.model.n_sites(), results))
    }

    fn run_trajectories<T, F>(&self, horizon: f64, simulate: F) -> SimResult<Vec<SimResult<T>>>
    where
        T: Send,
        F: Fn(&mut Engine) -> SimResult<T> + Sync,
    {
        let n_done = AtomicUsize::new(0);
        let run_all = || {
            (0..self.n_traj)
                .into_par_iter()
                .map(|i_traj| {
                    let rng = ChaCha12Rng::seed_from_u64(derive_seed(self.seed, i_traj as u64));
                    let result = Engine::new(self.model, horizon, rng)
                        .map(|engine| {
                            let engine = engine.with_audit(self.audit_every);
                            match self.max_events {
                                Some(max_events) => engine.with_max_events(max_events),
                                None => engine,
                            }
                        })
                        .and_then(|mut engine| simulate(&mut engine));

                    let n_done = n_done.fetch_add(1, Ordering::Relaxed) + 1;
                    if n_done % (self.n_traj / 10).max(1) == 0 {
                        let progress = 100.0 * n_done as f64 / self.n_traj as f64;
                        log::info!("completed {progress:06.2}%");
                    }
                    result
                })
                .collect::<Vec<_>>()
        };

        match self.n_threads {
            Some(n_threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n_threads)
                    .build()
                    .map_err(|err| {
                        SimError::InvalidConfiguration(format!("failed to build thread pool: {err}"))
                    })?;
                Ok(pool.install(run_all))
            }
            None => Ok(run_all()),
        }
    }
}

fn check_horizon(horizon: f64) -> SimResult<()> {
    if !(horizon.is_finite() && horizon > 0.0) {
        return Err(SimError::InvalidConfiguration(format!(
            "horizon must be positive and finite, but is {horizon}"
        )));
    }
    Ok(())
}

/// Seed of trajectory `i_traj`, mixed with SplitMix64 so that neighbouring
/// indices give unrelated streams.
pub fn derive_seed(seed: u64, i_traj: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let mut z = (seed ^ i_traj.wrapping_mul(GOLDEN_GAMMA)).wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

fn report_aborted(i_traj: usize, error: &SimError) -> Aborted {
    log::warn!("trajectory {i_traj} aborted: {error}");
    Aborted {
        i_traj,
        error: error.to_string(),
    }
}

/// Elementwise mean of the occupation series of all successful trajectories.
pub fn merge_transient(
    model: &RateModel,
    times: Vec<f64>,
    results: Vec<SimResult<TransientTrajectory>>,
) -> TransientReport {
    let mut occupation = vec![0.0; times.len()];
    let mut transit_times = Vec::new();
    let mut n_completed = 0;
    let mut n_deadlocked = 0;
    let mut aborted = Vec::new();

    for (i_traj, result) in results.into_iter().enumerate() {
        let traj = match result {
            Ok(traj) => traj,
            Err(error) => {
                aborted.push(report_aborted(i_traj, &error));
                continue;
            }
        };
        log::debug!("trajectory {i_traj} ended: {:?}", traj.outcome);

        n_completed += 1;
        if traj.outcome.kind == OutcomeKind::Deadlocked {
            n_deadlocked += 1;
        }
        occupation
            .iter_mut()
            .zip(&traj.occupation)
            .for_each(|(sum, &val)| *sum += val);
        transit_times.extend(traj.transit_time);
    }

    if n_completed == 0 {
        log::warn!("no trajectory completed");
        occupation.clear();
    }
    occupation
        .iter_mut()
        .for_each(|sum| *sum /= n_completed as f64);
    let n_codons = (model.n_sites() - 1) as f64;
    let density = occupation.iter().map(|&val| val / n_codons).collect();
    let transit = transit_times.iter().copied().collect::<Accumulator>().summary();

    TransientReport {
        times,
        occupation,
        density,
        transit_times,
        transit,
        free_transit_time: model.free_transit_time(),
        n_completed,
        n_deadlocked,
        aborted,
    }
}

/// Elementwise mean of the profiles of all trajectories that reached the
/// steady state.
pub fn merge_steady(n_sites: usize, results: Vec<SimResult<SteadyTrajectory>>) -> SteadyReport {
    let mut density = vec![0.0; n_sites];
    let mut current = vec![0.0; n_sites];
    let mut onset = Accumulator::new();
    let mut n_unsteady = 0;
    let mut n_deadlocked = 0;
    let mut aborted = Vec::new();

    for (i_traj, result) in results.into_iter().enumerate() {
        let traj = match result {
            Ok(traj) => traj,
            Err(error) => {
                aborted.push(report_aborted(i_traj, &error));
                continue;
            }
        };
        log::debug!("trajectory {i_traj} ended: {:?}", traj.outcome);

        if traj.outcome.kind == OutcomeKind::Deadlocked {
            n_deadlocked += 1;
        }
        let Some(profile) = traj.profile else {
            n_unsteady += 1;
            continue;
        };
        onset.add(profile.onset_time);
        density
            .iter_mut()
            .zip(&profile.density)
            .for_each(|(sum, &val)| *sum += val);
        current
            .iter_mut()
            .zip(&profile.current)
            .for_each(|(sum, &val)| *sum += val);
    }

    let onset = onset.summary();
    let n_steady = onset.n_vals;
    if n_steady == 0 {
        log::warn!("no trajectory reached the steady state");
        density.clear();
        current.clear();
    }
    for sum in density.iter_mut().chain(current.iter_mut()) {
        *sum /= n_steady as f64;
    }

    SteadyReport {
        density,
        current,
        onset,
        n_steady,
        n_unsteady,
        n_deadlocked,
        aborted,
    }
}
