use crate::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};

/// Hop rates and particle footprint of the exclusion process.
///
/// `rates[0]` is never used by a transition (attachment happens at `alpha`),
/// `rates[i]` for `1 <= i < n_sites - 1` is the elongation rate out of site
/// `i`, and the last entry is the detachment rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateModel {
    footprint: usize,
    alpha: f64,
    rates: Vec<f64>,
}

impl RateModel {
    /// Create a rate model from a full per-site rate profile.
    ///
    /// # Errors
    /// Returns [`SimError::InvalidConfiguration`] if the footprint is zero,
    /// the lattice is not longer than two footprints, or any rate is
    /// negative or not finite.
    pub fn new(footprint: usize, alpha: f64, rates: Vec<f64>) -> SimResult<Self> {
        let n_sites = rates.len();
        if footprint < 1 {
            return Err(invalid("footprint must be at least 1".into()));
        }
        if n_sites <= 2 * footprint {
            return Err(invalid(format!(
                "lattice must have more than {} sites, but has {n_sites}",
                2 * footprint
            )));
        }
        check_rate(alpha).map_err(|msg| invalid(format!("initiation rate {msg}")))?;
        for (i_site, &rate) in rates.iter().enumerate() {
            check_rate(rate).map_err(|msg| invalid(format!("rate at site {i_site} {msg}")))?;
        }

        Ok(Self {
            footprint,
            alpha,
            rates,
        })
    }

    /// Create a rate model with the same elongation rate on every site and a
    /// separate termination rate on the last one.
    pub fn uniform(
        footprint: usize,
        n_sites: usize,
        alpha: f64,
        elongation: f64,
        termination: f64,
    ) -> SimResult<Self> {
        if n_sites < 2 {
            return Err(invalid(format!(
                "lattice must have at least 2 sites, but has {n_sites}"
            )));
        }
        let mut rates = vec![elongation; n_sites];
        rates[0] = 0.0;
        rates[n_sites - 1] = termination;
        Self::new(footprint, alpha, rates)
    }

    pub fn footprint(&self) -> usize {
        self.footprint
    }

    pub fn n_sites(&self) -> usize {
        self.rates.len()
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn rate(&self, site: usize) -> f64 {
        self.rates[site]
    }

    /// Expected time for a lone particle to cross the lattice after
    /// attaching, i.e. the sum of the mean dwell times `1 / rates[i]`.
    pub fn free_transit_time(&self) -> f64 {
        self.rates[1..].iter().map(|&rate| rate.recip()).sum()
    }
}

fn invalid(msg: String) -> SimError {
    SimError::InvalidConfiguration(msg)
}

fn check_rate(rate: f64) -> Result<(), String> {
    if !rate.is_finite() {
        return Err(format!("must be finite, but is {rate}"));
    }
    if rate < 0.0 {
        return Err(format!("must be non-negative, but is {rate}"));
    }
    Ok(())
}
