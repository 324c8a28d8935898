use crate::engine::{Event, Observer, Outcome};
use crate::lattice::{Lattice, Regime};
use serde::{Deserialize, Serialize};

/// Relative change test between two occupation samples.
///
/// Steady once `|new - old| <= tolerance * old` for a non-empty `old`
/// sample, so an empty lattice is never considered steady.
pub fn is_steady(new: usize, old: usize, tolerance: f64) -> bool {
    if old == 0 {
        return false;
    }
    new.abs_diff(old) as f64 <= tolerance * old as f64
}

/// Samples the occupation number every `steps_per_check` events and records
/// the time at which it stops changing.
#[derive(Debug, Clone)]
pub struct SteadyStateDetector {
    steps_per_check: u64,
    tolerance: f64,
    n_seen: u64,
    old_count: Option<usize>,
    onset: Option<f64>,
}

impl SteadyStateDetector {
    pub fn new(steps_per_check: u64, tolerance: f64) -> Self {
        Self {
            steps_per_check: steps_per_check.max(1),
            tolerance,
            n_seen: 0,
            old_count: None,
            onset: None,
        }
    }

    #[cfg(test)]
    pub fn onset(&self) -> Option<f64> {
        self.onset
    }

    /// Feed one event, returning the onset time when it is first detected.
    fn observe(&mut self, event: &Event, lattice: &Lattice) -> Option<f64> {
        if self.onset.is_some() {
            return None;
        }
        self.n_seen += 1;
        if self.n_seen % self.steps_per_check != 0 {
            return None;
        }

        let new_count = lattice.occupation_number();
        let old_count = self.old_count.replace(new_count);
        if old_count.is_some_and(|old| is_steady(new_count, old, self.tolerance)) {
            self.onset = Some(event.t_new);
        }
        self.onset
    }
}

/// Time-averaged density and current per site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteadyProfile {
    pub onset_time: f64,
    pub window: f64,
    pub density: Vec<f64>,
    pub current: Vec<f64>,
}

/// Open statistics window, started at the steady-state onset.
#[derive(Debug, Clone)]
struct Window {
    start: f64,
    occupied_since: Vec<f64>,
    occupied_time: Vec<f64>,
    hop_counts: Vec<u64>,
}

impl Window {
    fn open(start: f64, lattice: &Lattice) -> Self {
        let n_sites = lattice.n_sites();
        let mut occupied_since = vec![0.0; n_sites];
        for site in lattice.occupied_sites() {
            occupied_since[site] = start;
        }
        Self {
            start,
            occupied_since,
            occupied_time: vec![0.0; n_sites],
            hop_counts: vec![0; n_sites],
        }
    }
}

/// Detects the steady state and then accumulates density and current until
/// the end of the trajectory.
///
/// Occupied time is added to a site when it is vacated, and to every site
/// still occupied when the trajectory finishes. This equals adding
/// `occupancy * dt` to every site at every event, at constant cost per event.
#[derive(Debug, Clone)]
pub struct SteadyState {
    detector: SteadyStateDetector,
    window: Option<Window>,
    profile: Option<SteadyProfile>,
}

impl SteadyState {
    pub fn new(steps_per_check: u64, tolerance: f64) -> Self {
        Self {
            detector: SteadyStateDetector::new(steps_per_check, tolerance),
            window: None,
            profile: None,
        }
    }

    #[cfg(test)]
    pub fn onset(&self) -> Option<f64> {
        self.detector.onset()
    }

    /// Profile over the window, if the steady state was reached before the
    /// end of the trajectory.
    #[cfg(test)]
    pub fn profile(&self) -> Option<&SteadyProfile> {
        self.profile.as_ref()
    }

    pub fn into_profile(self) -> Option<SteadyProfile> {
        self.profile
    }
}

impl Observer for SteadyState {
    fn on_event(&mut self, event: &Event, lattice: &Lattice) {
        match &mut self.window {
            Some(window) => {
                window.hop_counts[event.index] += 1;
                if let Some(site) = event.vacated {
                    window.occupied_time[site] += event.t_new - window.occupied_since[site];
                }
                if let Some(site) = event.occupied {
                    window.occupied_since[site] = event.t_new;
                }
            }
            None => {
                if let Some(start) = self.detector.observe(event, lattice) {
                    self.window = Some(Window::open(start, lattice));
                }
            }
        }
    }

    fn finish(&mut self, outcome: &Outcome, lattice: &Lattice) {
        let Some(mut window) = self.window.take() else {
            return;
        };
        let length = outcome.end_time - window.start;
        if length <= 0.0 {
            return;
        }

        for site in lattice.occupied_sites() {
            window.occupied_time[site] += outcome.end_time - window.occupied_since[site];
        }
        self.profile = Some(SteadyProfile {
            onset_time: window.start,
            window: length,
            density: window.occupied_time.iter().map(|&t| t / length).collect(),
            current: window
                .hop_counts
                .iter()
                .map(|&n| n as f64 / length)
                .collect(),
        });
    }
}

/// Occupation number sampled on a fixed time grid by zero-order hold.
///
/// Every grid point falling in `[t_old, t_new)` of an event reads the
/// occupation number before that event. Grid points after the last event
/// read the final occupation number.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancySeries {
    dt: f64,
    values: Vec<f64>,
    next_bin: usize,
}

impl OccupancySeries {
    /// Grid `k * dt` for `k` in `0..n_bins`, with `dt = horizon / n_bins`.
    pub fn new(horizon: f64, n_bins: usize) -> Self {
        Self {
            dt: horizon / n_bins as f64,
            values: vec![0.0; n_bins],
            next_bin: 0,
        }
    }

    pub fn times(&self) -> Vec<f64> {
        (0..self.values.len()).map(|k| self.time(k)).collect()
    }

    #[cfg(test)]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    fn time(&self, bin: usize) -> f64 {
        bin as f64 * self.dt
    }

    fn fill_until(&mut self, t_end: Option<f64>, value: usize) {
        while self.next_bin < self.values.len()
            && t_end.is_none_or(|t_end| self.time(self.next_bin) < t_end)
        {
            self.values[self.next_bin] = value as f64;
            self.next_bin += 1;
        }
    }
}

impl Observer for OccupancySeries {
    fn on_event(&mut self, event: &Event, _lattice: &Lattice) {
        self.fill_until(Some(event.t_new), event.n_before);
    }

    fn finish(&mut self, _outcome: &Outcome, lattice: &Lattice) {
        self.fill_until(None, lattice.occupation_number());
    }
}

/// Attachment and exit times of the tagged particle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaggedPassage {
    pub attach_time: f64,
    pub exit_time: f64,
}

impl TaggedPassage {
    pub fn transit_time(&self) -> f64 {
        self.exit_time - self.attach_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
enum Tag {
    #[default]
    Waiting,
    OnLattice { site: usize, attach_time: f64 },
    Done(TaggedPassage),
}

/// Follows the first particle to attach until it leaves the lattice.
#[derive(Debug, Clone, Default)]
pub struct TaggedParticle {
    tag: Tag,
}

impl TaggedParticle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current leading-edge site of the tagged particle.
    #[cfg(test)]
    pub fn site(&self) -> Option<usize> {
        match self.tag {
            Tag::OnLattice { site, .. } => Some(site),
            _ => None,
        }
    }

    pub fn passage(&self) -> Option<TaggedPassage> {
        match self.tag {
            Tag::Done(passage) => Some(passage),
            _ => None,
        }
    }
}

impl Observer for TaggedParticle {
    fn on_event(&mut self, event: &Event, _lattice: &Lattice) {
        self.tag = match self.tag {
            Tag::Waiting if event.regime == Regime::Initiation => Tag::OnLattice {
                site: 1,
                attach_time: event.t_new,
            },
            Tag::OnLattice { site, attach_time } if event.index == site => match event.occupied {
                Some(site) => Tag::OnLattice { site, attach_time },
                None => Tag::Done(TaggedPassage {
                    attach_time,
                    exit_time: event.t_new,
                }),
            },
            tag => tag,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, OutcomeKind, Step};
    use crate::model::RateModel;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    /// Keeps every event and the occupancy after it.
    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
        occupancy: Vec<Vec<bool>>,
    }

    impl Observer for Recorder {
        fn on_event(&mut self, event: &Event, lattice: &Lattice) {
            self.events.push(*event);
            self.occupancy.push(lattice.occupancy().to_vec());
        }
    }

    fn rng(seed: u64) -> ChaCha12Rng {
        ChaCha12Rng::seed_from_u64(seed)
    }

    #[test]
    fn steady_test_uses_relative_change() {
        assert!(is_steady(100, 100, 0.0));
        assert!(is_steady(101, 100, 0.01));
        assert!(is_steady(99, 100, 0.01));
        assert!(!is_steady(102, 100, 0.01));
        assert!(!is_steady(0, 0, 0.5));
        assert!(!is_steady(3, 0, 0.5));
    }

    #[test]
    fn series_holds_state_between_events() {
        let model = RateModel::uniform(2, 15, 0.8, 1.0, 1.0).unwrap();
        let horizon = 30.0;
        let mut engine = Engine::new(&model, horizon, rng(1)).unwrap();
        let mut observer = (OccupancySeries::new(horizon, 300), Recorder::default());
        engine.run(&mut observer).unwrap();
        let (series, recorder) = observer;

        assert!(!recorder.events.is_empty());
        for (k, &time) in series.times().iter().enumerate() {
            let expected = match recorder
                .events
                .iter()
                .find(|event| event.t_old <= time && time < event.t_new)
            {
                Some(event) => event.n_before,
                None => engine.lattice().occupation_number(),
            };
            assert_eq!(series.values()[k], expected as f64, "bin {k} at {time}");
        }
        assert_eq!(series.values()[0], 0.0);
    }

    #[test]
    fn zero_initiation_rate_keeps_lattice_empty() {
        let model = RateModel::uniform(3, 20, 0.0, 1.0, 1.0).unwrap();
        let mut engine = Engine::new(&model, 100.0, rng(2)).unwrap();
        let mut series = OccupancySeries::new(100.0, 50);

        let outcome = engine.run(&mut series).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Deadlocked);
        assert!(series.values().iter().all(|&val| val == 0.0));
    }

    #[test]
    fn series_back_fills_after_deadlock() {
        let mut rates = vec![1.0; 6];
        rates[5] = 0.0;
        let model = RateModel::new(1, 5.0, rates).unwrap();
        let mut engine = Engine::new(&model, 1000.0, rng(3)).unwrap();
        let mut series = OccupancySeries::new(1000.0, 100);

        let outcome = engine.run(&mut series).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Deadlocked);
        assert_eq!(series.values()[99], 5.0);
    }

    #[test]
    fn tagged_particle_follows_first_attachment() {
        let model = RateModel::uniform(2, 12, 0.3, 1.0, 1.0).unwrap();
        let mut engine = Engine::new(&model, 500.0, rng(4)).unwrap();
        let mut tagged = TaggedParticle::default();
        assert_eq!(tagged.site(), None);
        assert_eq!(tagged.passage(), None);
        let mut first_attach = None;
        let mut exit = None;

        loop {
            let Step::Event(event) = engine.next_event().unwrap() else {
                break;
            };
            if first_attach.is_none() && event.regime == Regime::Initiation {
                first_attach = Some(event.t_new);
            }
            // The first particle to attach is always the first one to leave.
            if exit.is_none() && event.regime == Regime::Detachment {
                exit = Some(event.t_new);
            }
            tagged.on_event(&event, engine.lattice());
            if let Some(site) = tagged.site() {
                assert!(engine.lattice().occupied(site));
            }
        }

        let passage = tagged.passage().unwrap();
        assert_eq!(Some(passage.attach_time), first_attach);
        assert_eq!(Some(passage.exit_time), exit);
        assert!(passage.transit_time() > 0.0);
    }

    #[test]
    fn window_density_matches_event_by_event_sum() {
        let model = RateModel::uniform(3, 40, 0.4, 1.0, 0.8).unwrap();
        let horizon = 2000.0;
        let mut engine = Engine::new(&model, horizon, rng(5)).unwrap();
        let mut observer = (SteadyState::new(200, 0.25), Recorder::default());
        let outcome = engine.run(&mut observer).unwrap();
        let (steady, recorder) = observer;
        let profile = steady.profile().unwrap();

        let mut expected = vec![0.0; 40];
        let mut t_prev = profile.onset_time;
        let mut occupancy: Option<&Vec<bool>> = None;
        for (event, after) in recorder.events.iter().zip(&recorder.occupancy) {
            if event.t_new <= profile.onset_time {
                occupancy = Some(after);
                continue;
            }
            let before = occupancy.unwrap();
            for (site, &occ) in before.iter().enumerate() {
                if occ {
                    expected[site] += event.t_new - t_prev;
                }
            }
            t_prev = event.t_new;
            occupancy = Some(after);
        }
        for (site, &occ) in occupancy.unwrap().iter().enumerate() {
            if occ {
                expected[site] += outcome.end_time - t_prev;
            }
        }

        assert_eq!(profile.window, outcome.end_time - profile.onset_time);
        for (site, &density) in profile.density.iter().enumerate() {
            let brute = expected[site] / profile.window;
            assert!((density - brute).abs() < 1e-9, "site {site}: {density} vs {brute}");
            assert!((0.0..=1.0).contains(&density));
        }
    }

    #[test]
    fn steady_current_is_continuous() {
        let model = RateModel::uniform(2, 30, 0.5, 1.0, 1.0).unwrap();
        let horizon = 5000.0;
        let mut engine = Engine::new(&model, horizon, rng(6)).unwrap();
        let mut steady = SteadyState::new(1000, 0.2);
        engine.run(&mut steady).unwrap();
        let profile = steady.into_profile().unwrap();

        // Hops into a site and out of it differ by at most the one particle
        // that may sit there at either end of the window.
        let counts: Vec<f64> = profile.current.iter().map(|j| j * profile.window).collect();
        for i_site in 0..counts.len() - 1 {
            let diff = (counts[i_site] - counts[i_site + 1]).abs();
            assert!(diff < 1.0 + 1e-6, "sites {i_site}, {}: {diff}", i_site + 1);
        }
        assert!(counts[0] > 100.0);
    }

    #[test]
    fn no_profile_without_steady_state() {
        let model = RateModel::uniform(1, 10, 0.0, 1.0, 1.0).unwrap();
        let mut engine = Engine::new(&model, 10.0, rng(7)).unwrap();
        let mut steady = SteadyState::new(10, 0.1);
        engine.run(&mut steady).unwrap();
        assert_eq!(steady.onset(), None);
        assert!(steady.profile().is_none());
    }
}
