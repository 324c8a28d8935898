use crate::error::{SimError, SimResult};
use crate::model::RateModel;
use thiserror::Error;

/// Relative tolerance between the running total rate and a full resum.
const TOTAL_RATE_TOL: f64 = 1e-9;

/// Lattice region a transition index falls into.
///
/// Each region has its own update rule, so that an event only ever touches
/// the propensities it can actually change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Regime {
    /// A new particle attaches at site 1.
    Initiation,
    /// Hop out of sites `1..footprint`, nothing can be waiting behind.
    EntryElongation,
    /// Hop out of site `footprint`, which frees the entry region.
    Clearing,
    /// Hop in the bulk, possibly unblocking the particle one footprint behind.
    BulkElongation,
    /// Hop close to the end, where nothing ahead can block the particle.
    ExitElongation,
    /// The particle at the last site leaves the lattice.
    Detachment,
}

impl Regime {
    /// Classify a transition index, or return `None` if it lies outside the
    /// lattice.
    pub fn classify(index: usize, footprint: usize, n_sites: usize) -> Option<Self> {
        if index >= n_sites {
            return None;
        }
        let regime = if index == 0 {
            Self::Initiation
        } else if index == n_sites - 1 {
            Self::Detachment
        } else if index < footprint {
            Self::EntryElongation
        } else if index == footprint {
            Self::Clearing
        } else if index + footprint + 2 <= n_sites {
            Self::BulkElongation
        } else {
            Self::ExitElongation
        };
        Some(regime)
    }
}

/// Sites changed by one applied transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub regime: Regime,
    pub vacated: Option<usize>,
    pub occupied: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("lattice invariant violated: {0}")]
pub struct InvariantViolation(pub String);

/// Occupancy of particle leading edges together with the propensity of
/// every transition.
///
/// Both arrays are only mutated through [`Lattice::apply_transition`], which
/// keeps them consistent with each other and with the running total rate.
#[derive(Debug, Clone)]
pub struct Lattice<'a> {
    model: &'a RateModel,
    occupancy: Vec<bool>,
    propensity: Vec<f64>,
    total_rate: f64,
    n_active: usize,
    n_particles: usize,
}

impl<'a> Lattice<'a> {
    /// Create an empty lattice where only initiation is possible.
    pub fn new(model: &'a RateModel) -> Self {
        let n_sites = model.n_sites();
        let mut lattice = Self {
            model,
            occupancy: vec![false; n_sites],
            propensity: vec![0.0; n_sites],
            total_rate: 0.0,
            n_active: 0,
            n_particles: 0,
        };
        lattice.set_propensity(0, model.alpha());
        lattice
    }

    pub fn n_sites(&self) -> usize {
        self.occupancy.len()
    }

    pub fn occupied(&self, site: usize) -> bool {
        self.occupancy.get(site).copied().unwrap_or(false)
    }

    #[cfg(test)]
    pub fn occupancy(&self) -> &[bool] {
        &self.occupancy
    }

    #[cfg(test)]
    pub fn propensity(&self, index: usize) -> f64 {
        self.propensity[index]
    }

    pub fn propensities(&self) -> &[f64] {
        &self.propensity
    }

    /// Running sum of all propensities.
    pub fn total_rate(&self) -> f64 {
        self.total_rate
    }

    /// Number of particles on the lattice.
    pub fn occupation_number(&self) -> usize {
        self.n_particles
    }

    /// No transition has positive propensity.
    pub fn is_jammed(&self) -> bool {
        self.n_active == 0
    }

    /// Sum of all propensities, computed from scratch.
    pub fn recomputed_total(&self) -> f64 {
        self.propensity.iter().sum()
    }

    /// Replace the running total by a full resum to discard rounding drift.
    pub fn resync_total(&mut self) {
        self.total_rate = if self.n_active == 0 {
            0.0
        } else {
            self.recomputed_total()
        };
    }

    /// Apply the transition with the given index.
    ///
    /// # Errors
    /// Returns [`SimError::IllegalTransition`] if the index is out of range
    /// or its propensity is zero. The lattice is left untouched in that case.
    pub fn apply_transition(&mut self, index: usize) -> SimResult<Transition> {
        let footprint = self.model.footprint();
        let regime = Regime::classify(index, footprint, self.n_sites())
            .ok_or_else(|| self.illegal(index))?;
        if self.propensity[index] <= 0.0 {
            return Err(self.illegal(index));
        }

        let mut vacated = Some(index);
        let mut occupied = Some(index + 1);
        match regime {
            Regime::Initiation => {
                vacated = None;
                self.occupy(1);
                self.set_propensity(0, 0.0);
                self.arm_ahead(1);
            }
            Regime::EntryElongation => {
                self.hop(index);
            }
            Regime::Clearing => {
                self.hop(index);
                self.set_propensity(0, self.model.alpha());
            }
            Regime::BulkElongation => {
                self.hop(index);
                self.rearm_behind(index);
            }
            Regime::ExitElongation => {
                self.vacate(index);
                self.occupy(index + 1);
                self.set_propensity(index, 0.0);
                self.set_propensity(index + 1, self.model.rate(index + 1));
                self.rearm_behind(index);
            }
            Regime::Detachment => {
                occupied = None;
                self.vacate(index);
                self.set_propensity(index, 0.0);
                self.rearm_behind(index);
            }
        }

        Ok(Transition {
            regime,
            vacated,
            occupied,
        })
    }

    /// Check occupancy, spacing and propensity invariants against a full
    /// recomputation.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let footprint = self.model.footprint();
        if self.occupancy[0] {
            return Err(violation("initiation site is occupied".into()));
        }

        let mut prev_site: Option<usize> = None;
        let mut n_particles = 0;
        for site in self.occupied_sites() {
            if let Some(prev) = prev_site {
                if site - prev < footprint {
                    return Err(violation(format!(
                        "particles at {prev} and {site} closer than footprint {footprint}"
                    )));
                }
            }
            prev_site = Some(site);
            n_particles += 1;
        }
        if n_particles != self.n_particles {
            return Err(violation(format!(
                "counted {n_particles} particles, but tracked {}",
                self.n_particles
            )));
        }

        for (index, &value) in self.propensity.iter().enumerate() {
            let expected = self.expected_propensity(index);
            if (value - expected).abs() > TOTAL_RATE_TOL * expected.abs().max(1.0) {
                return Err(violation(format!(
                    "propensity at {index} is {value}, but should be {expected}"
                )));
            }
        }

        let n_active = self.propensity.iter().filter(|&&val| val > 0.0).count();
        if n_active != self.n_active {
            return Err(violation(format!(
                "counted {n_active} active transitions, but tracked {}",
                self.n_active
            )));
        }

        let total = self.recomputed_total();
        if (total - self.total_rate).abs() > TOTAL_RATE_TOL * total.max(1.0) {
            return Err(violation(format!(
                "total rate is {}, but propensities sum to {total}",
                self.total_rate
            )));
        }

        Ok(())
    }

    /// Human readable dump of the occupied sites and active transitions.
    pub fn describe(&self) -> String {
        let sites: Vec<_> = self.occupied_sites().collect();
        let active: String = self
            .propensity
            .iter()
            .enumerate()
            .filter(|(_, value)| **value > 0.0)
            .map(|(index, value)| format!(" {index}:{value}"))
            .collect();
        format!(
            "occupied {sites:?}, active [{active} ], total rate {}",
            self.total_rate
        )
    }

    pub fn occupied_sites(&self) -> impl Iterator<Item = usize> + '_ {
        self.occupancy
            .iter()
            .enumerate()
            .filter_map(|(site, &occ)| occ.then_some(site))
    }

    fn expected_propensity(&self, index: usize) -> f64 {
        let footprint = self.model.footprint();
        if index == 0 {
            let entry_free = (1..=footprint).all(|site| !self.occupied(site));
            return if entry_free { self.model.alpha() } else { 0.0 };
        }
        if !self.occupancy[index] || self.occupied(index + footprint) {
            return 0.0;
        }
        self.model.rate(index)
    }

    fn hop(&mut self, index: usize) {
        self.vacate(index);
        self.occupy(index + 1);
        self.set_propensity(index, 0.0);
        self.arm_ahead(index + 1);
    }

    /// Gate the particle at `site` by the site one footprint ahead.
    fn arm_ahead(&mut self, site: usize) {
        let blocked = self.occupied(site + self.model.footprint());
        let rate = if blocked { 0.0 } else { self.model.rate(site) };
        self.set_propensity(site, rate);
    }

    /// Re-arm whichever particle sits one footprint behind a vacated site.
    fn rearm_behind(&mut self, index: usize) {
        let site = index - self.model.footprint();
        debug_assert!(site >= 1);
        let rate = if self.occupancy[site] {
            self.model.rate(site)
        } else {
            0.0
        };
        self.set_propensity(site, rate);
    }

    fn occupy(&mut self, site: usize) {
        self.occupancy[site] = true;
        self.n_particles += 1;
    }

    fn vacate(&mut self, site: usize) {
        self.occupancy[site] = false;
        self.n_particles -= 1;
    }

    fn set_propensity(&mut self, index: usize, value: f64) {
        let old = std::mem::replace(&mut self.propensity[index], value);
        match (old > 0.0, value > 0.0) {
            (false, true) => self.n_active += 1,
            (true, false) => self.n_active -= 1,
            _ => {}
        }
        if self.n_active == 0 {
            self.total_rate = 0.0;
        } else {
            self.total_rate += value - old;
        }
    }

    fn illegal(&self, index: usize) -> SimError {
        SimError::IllegalTransition {
            index,
            state: self.describe(),
        }
    }
}

fn violation(msg: String) -> InvariantViolation {
    InvariantViolation(msg)
}
