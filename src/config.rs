use crate::error::SimResult;
use crate::model::RateModel;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub run: RunConfig,
    /// Steady-state runs, if enabled.
    pub steady: Option<SteadyConfig>,
    /// Early-time runs, if enabled.
    pub transient: Option<TransientConfig>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of sites covered by one particle.
    pub footprint: usize,
    /// Initiation rate.
    pub alpha: f64,
    /// Per-site hop rates.
    pub rates: RateProfile,
}

/// Hop rates, either site by site or as a uniform lattice.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateProfile {
    /// One rate per site; the first entry is ignored and the last one is the
    /// termination rate.
    Sites(Vec<f64>),
    Uniform {
        n_sites: usize,
        elongation: f64,
        termination: f64,
    },
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of independent trajectories.
    pub n_traj: usize,
    /// Base seed of the trajectory generators.
    pub seed: Option<u64>,
    /// Number of worker threads (defaults to one per core).
    pub n_threads: Option<usize>,
    /// Number of events between lattice invariant audits (0 disables them).
    #[serde(default)]
    pub audit_every: u64,
    /// Largest number of events per trajectory.
    pub max_events: Option<u64>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SteadyConfig {
    /// Simulated time of each trajectory.
    pub t_max: f64,
    /// Number of events between occupation samples.
    pub steps_per_check: u64,
    /// Largest relative change between samples considered steady.
    pub tolerance: f64,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TransientConfig {
    /// Simulated time of each trajectory.
    pub t_max: f64,
    /// Number of grid points of the occupation series.
    pub n_bins: usize,
}

impl ModelConfig {
    /// Build the rate model described by this section.
    pub fn rate_model(&self) -> SimResult<RateModel> {
        match &self.rates {
            RateProfile::Sites(rates) => RateModel::new(self.footprint, self.alpha, rates.clone()),
            &RateProfile::Uniform {
                n_sites,
                elongation,
                termination,
            } => RateModel::uniform(self.footprint, n_sites, self.alpha, elongation, termination),
        }
    }
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        let config: Config = toml::from_str(&contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.model
            .rate_model()
            .context("invalid model parameters")?;

        check_num(self.run.n_traj, 1..10_000_000).context("invalid number of trajectories")?;
        if let Some(n_threads) = self.run.n_threads {
            check_num(n_threads, 1..=1024).context("invalid number of threads")?;
        }
        if let Some(max_events) = self.run.max_events {
            check_num(max_events, 1..).context("invalid event budget")?;
        }

        if let Some(steady) = &self.steady {
            check_time(steady.t_max).context("invalid steady-state horizon")?;
            check_num(steady.steps_per_check, 1..)
                .context("invalid number of steps per check")?;
            check_num(steady.tolerance, 0.0..=1.0).context("invalid steady-state tolerance")?;
        }

        if let Some(transient) = &self.transient {
            check_time(transient.t_max).context("invalid transient horizon")?;
            check_num(transient.n_bins, 1..100_000_000).context("invalid number of bins")?;
        }

        if self.steady.is_none() && self.transient.is_none() {
            bail!("config must enable at least one of [steady] or [transient]");
        }

        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_time(time: f64) -> Result<()> {
    if !time.is_finite() {
        bail!("time must be finite, but is {time}");
    }
    check_num(time, f64::MIN_POSITIVE..)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIFORM: &str = r#"
[model]
footprint = 3
alpha = 0.2
rates = { n_sites = 40, elongation = 1.0, termination = 0.5 }

[run]
n_traj = 16
seed = 7

[steady]
t_max = 1000.0
steps_per_check = 500
tolerance = 0.05

[transient]
t_max = 50.0
n_bins = 100
"#;

    #[test]
    fn parses_uniform_profile() {
        let config: Config = toml::from_str(UNIFORM).unwrap();
        config.validate().unwrap();

        assert_eq!(config.run.audit_every, 0);
        assert_eq!(config.run.n_threads, None);
        assert_eq!(config.run.max_events, None);
        let model = config.model.rate_model().unwrap();
        assert_eq!(model.n_sites(), 40);
        assert_eq!(model.footprint(), 3);
        assert_eq!(model.rate(39), 0.5);
    }

    #[test]
    fn parses_site_profile() {
        let contents = r#"
[model]
footprint = 1
alpha = 1.0
rates = [0.0, 1.0, 2.0, 3.0, 4.0]

[run]
n_traj = 1
audit_every = 10
max_events = 100000

[transient]
t_max = 5.0
n_bins = 10
"#;
        let config: Config = toml::from_str(contents).unwrap();
        config.validate().unwrap();

        assert!(config.steady.is_none());
        assert_eq!(config.run.seed, None);
        assert_eq!(config.run.max_events, Some(100_000));
        assert_eq!(
            config.model.rates,
            RateProfile::Sites(vec![0.0, 1.0, 2.0, 3.0, 4.0])
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let config: Config = toml::from_str(UNIFORM).unwrap();

        let mut short = config.clone();
        short.model.rates = RateProfile::Sites(vec![0.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
        assert!(short.validate().is_err());

        let mut negative = config.clone();
        negative.model.alpha = -1.0;
        assert!(negative.validate().is_err());

        let mut no_traj = config.clone();
        no_traj.run.n_traj = 0;
        assert!(no_traj.validate().is_err());

        let mut no_time = config.clone();
        no_time.transient = Some(TransientConfig {
            t_max: 0.0,
            n_bins: 10,
        });
        assert!(no_time.validate().is_err());

        let mut nothing = config;
        nothing.steady = None;
        nothing.transient = None;
        assert!(nothing.validate().is_err());
    }
}
