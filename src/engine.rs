use crate::error::{SimError, SimResult};
use crate::lattice::{Lattice, Regime};
use crate::model::RateModel;
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::Open01;
use serde::{Deserialize, Serialize};

/// Number of events between full resums of the total rate.
const RESYNC_PERIOD: u64 = 1 << 20;

/// One applied transition of the jump process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    /// Index of the transition that fired.
    pub index: usize,
    pub regime: Regime,
    /// Time of the previous event (or zero).
    pub t_old: f64,
    /// Time at which this event fired.
    pub t_new: f64,
    /// Occupation number just before this event was applied.
    pub n_before: usize,
    pub vacated: Option<usize>,
    pub occupied: Option<usize>,
}

/// Result of asking the engine for the next event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Event(Event),
    /// No transition has positive propensity.
    Deadlocked,
    /// The next event would fire after the horizon.
    HorizonReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    HorizonReached,
    Deadlocked,
    StepBudget,
}

/// How and when a trajectory ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    /// End of the observation window. A deadlocked lattice is frozen, so it
    /// is observed up to the horizon.
    pub end_time: f64,
    /// Time of the last applied event.
    pub last_event_time: f64,
    pub n_events: u64,
}

/// Consumer of the event stream of one trajectory.
pub trait Observer {
    fn on_event(&mut self, event: &Event, lattice: &Lattice);

    fn finish(&mut self, _outcome: &Outcome, _lattice: &Lattice) {}
}

impl Observer for () {
    fn on_event(&mut self, _event: &Event, _lattice: &Lattice) {}
}

impl<A: Observer, B: Observer> Observer for (A, B) {
    fn on_event(&mut self, event: &Event, lattice: &Lattice) {
        self.0.on_event(event, lattice);
        self.1.on_event(event, lattice);
    }

    fn finish(&mut self, outcome: &Outcome, lattice: &Lattice) {
        self.0.finish(outcome, lattice);
        self.1.finish(outcome, lattice);
    }
}

/// Gillespie simulation of a single trajectory.
///
/// Owns the lattice, the clock and the random number generator of the
/// trajectory; the rate model is shared.
pub struct Engine<'a> {
    lattice: Lattice<'a>,
    rng: ChaCha12Rng,
    time: f64,
    horizon: f64,
    n_events: u64,
    audit_every: u64,
    max_events: Option<u64>,
    terminal: Option<Step>,
}

impl<'a> Engine<'a> {
    /// Create an engine on an empty lattice.
    ///
    /// # Errors
    /// Returns [`SimError::InvalidConfiguration`] if the horizon is not a
    /// positive finite time.
    pub fn new(model: &'a RateModel, horizon: f64, rng: ChaCha12Rng) -> SimResult<Self> {
        if !(horizon.is_finite() && horizon > 0.0) {
            return Err(SimError::InvalidConfiguration(format!(
                "horizon must be positive and finite, but is {horizon}"
            )));
        }
        Ok(Self {
            lattice: Lattice::new(model),
            rng,
            time: 0.0,
            horizon,
            n_events: 0,
            audit_every: 0,
            max_events: None,
            terminal: None,
        })
    }

    /// Check all lattice invariants every `audit_every` events (0 disables).
    pub fn with_audit(mut self, audit_every: u64) -> Self {
        self.audit_every = audit_every;
        self
    }

    /// Stop after at most `max_events` events.
    pub fn with_max_events(mut self, max_events: u64) -> Self {
        self.max_events = Some(max_events);
        self
    }

    #[cfg(test)]
    pub fn lattice(&self) -> &Lattice<'a> {
        &self.lattice
    }

    #[cfg(test)]
    pub fn time(&self) -> f64 {
        self.time
    }

    #[cfg(test)]
    pub fn n_events(&self) -> u64 {
        self.n_events
    }

    /// Sample, select and apply the next event.
    ///
    /// Once a terminal step has been returned, every later call returns it
    /// again without touching the state.
    pub fn next_event(&mut self) -> SimResult<Step> {
        if let Some(step) = self.terminal {
            return Ok(step);
        }
        if self.lattice.is_jammed() {
            return Ok(self.terminate(Step::Deadlocked));
        }

        let total_rate = self.lattice.total_rate();
        let t_new = self.time + sample_waiting_time(total_rate, &mut self.rng)?;
        if t_new > self.horizon {
            self.time = self.horizon;
            return Ok(self.terminate(Step::HorizonReached));
        }

        let index = select_transition(self.lattice.propensities(), total_rate, &mut self.rng)?;
        let n_before = self.lattice.occupation_number();
        let transition = self.lattice.apply_transition(index)?;

        let t_old = self.time;
        self.time = t_new;
        self.n_events += 1;

        if self.n_events % RESYNC_PERIOD == 0 {
            self.lattice.resync_total();
        }
        if self.audit_every > 0 && self.n_events % self.audit_every == 0 {
            self.lattice
                .check_invariants()
                .map_err(|violation| SimError::IllegalTransition {
                    index,
                    state: format!("{violation}; {}", self.lattice.describe()),
                })?;
        }

        Ok(Step::Event(Event {
            index,
            regime: transition.regime,
            t_old,
            t_new,
            n_before,
            vacated: transition.vacated,
            occupied: transition.occupied,
        }))
    }

    /// Drive the trajectory to its end, feeding every event to `observer`.
    pub fn run<O: Observer>(&mut self, observer: &mut O) -> SimResult<Outcome> {
        let kind = loop {
            if self.max_events.is_some_and(|max| self.n_events >= max) {
                break OutcomeKind::StepBudget;
            }
            match self.next_event()? {
                Step::Event(event) => observer.on_event(&event, &self.lattice),
                Step::Deadlocked => break OutcomeKind::Deadlocked,
                Step::HorizonReached => break OutcomeKind::HorizonReached,
            }
        };

        let end_time = match kind {
            OutcomeKind::StepBudget => self.time,
            OutcomeKind::HorizonReached | OutcomeKind::Deadlocked => self.horizon,
        };
        let outcome = Outcome {
            kind,
            end_time,
            last_event_time: self.time.min(end_time),
            n_events: self.n_events,
        };
        observer.finish(&outcome, &self.lattice);

        Ok(outcome)
    }

    fn terminate(&mut self, step: Step) -> Step {
        self.terminal = Some(step);
        step
    }
}

/// Sample an exponential waiting time with the given total rate.
///
/// # Errors
/// Returns [`SimError::DomainError`] if the total rate is not positive.
pub fn sample_waiting_time<R: Rng + ?Sized>(total_rate: f64, rng: &mut R) -> SimResult<f64> {
    if !(total_rate.is_finite() && total_rate > 0.0) {
        return Err(SimError::DomainError { total_rate });
    }
    let u: f64 = rng.sample(Open01);
    Ok(-u.ln() / total_rate)
}

/// Select a transition index with probability proportional to its
/// propensity, by inverse transform over the cumulative sum.
///
/// Entries are scanned in ascending order, the same order in which the
/// total rate is accumulated. If rounding leaves the cumulative sum short of
/// the target, the last active index is returned.
pub fn select_transition<R: Rng + ?Sized>(
    propensities: &[f64],
    total_rate: f64,
    rng: &mut R,
) -> SimResult<usize> {
    let u: f64 = rng.sample(Open01);
    let target = u * total_rate;

    let mut cum = 0.0;
    let mut last_active = None;
    for (index, &propensity) in propensities.iter().enumerate() {
        if propensity <= 0.0 {
            continue;
        }
        cum += propensity;
        last_active = Some(index);
        if cum >= target {
            return Ok(index);
        }
    }
    last_active.ok_or(SimError::DomainError { total_rate })
}
