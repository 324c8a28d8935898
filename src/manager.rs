use crate::config::Config;
use crate::ensemble::Ensemble;
use crate::model::RateModel;
use anyhow::{Context, Result};
use glob::glob;
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rmp_serde::encode;
use serde::Serialize;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    pub fn run_steady(&self) -> Result<()> {
        let steady = self
            .cfg
            .steady
            .as_ref()
            .context("config has no [steady] section")?;

        let run_dir = self.create_run_dir()?;
        let model = self.cfg.model.rate_model()?;
        let ensemble = self.ensemble(&model)?;

        let report = ensemble
            .run_steady(steady.t_max, steady.steps_per_check, steady.tolerance)
            .context("failed to run steady-state ensemble")?;
        log::info!(
            "steady in {} of {} trajectories (onset {:.3} ± {:.3})",
            report.n_steady,
            self.cfg.run.n_traj,
            report.onset.mean,
            report.onset.sem
        );
        if report.n_deadlocked > 0 {
            log::warn!("{} trajectories deadlocked", report.n_deadlocked);
        }

        save_report(run_dir.join("steady.msgpack"), &report)
    }

    pub fn run_transient(&self) -> Result<()> {
        let transient = self
            .cfg
            .transient
            .as_ref()
            .context("config has no [transient] section")?;

        let run_dir = self.create_run_dir()?;
        let model = self.cfg.model.rate_model()?;
        let ensemble = self.ensemble(&model)?;

        let report = ensemble
            .run_transient(transient.t_max, transient.n_bins)
            .context("failed to run transient ensemble")?;
        log::info!(
            "tagged transit time {:.4} ± {:.4} over {} trajectories (free transit {:.4})",
            report.transit.mean,
            report.transit.sem,
            report.n_completed,
            report.free_transit_time
        );
        if report.n_deadlocked > 0 {
            log::warn!("{} trajectories deadlocked", report.n_deadlocked);
        }

        save_report(run_dir.join("transient.msgpack"), &report)
    }

    pub fn clean_sim(&self) -> Result<()> {
        for run_dir in self.run_dirs()? {
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }
        Ok(())
    }

    fn ensemble<'a>(&self, model: &'a RateModel) -> Result<Ensemble<'a>> {
        let seed = match self.cfg.run.seed {
            Some(seed) => seed,
            None => {
                let seed = ChaCha12Rng::try_from_os_rng()?.next_u64();
                log::info!("drew seed {seed} from OS entropy");
                seed
            }
        };

        let mut ensemble = Ensemble::new(model, self.cfg.run.n_traj, seed)
            .context("failed to construct ensemble")?
            .with_audit(self.cfg.run.audit_every);
        if let Some(n_threads) = self.cfg.run.n_threads {
            ensemble = ensemble.with_threads(n_threads);
        }
        if let Some(max_events) = self.cfg.run.max_events {
            ensemble = ensemble.with_max_events(max_events);
        }
        Ok(ensemble)
    }

    fn create_run_dir(&self) -> Result<PathBuf> {
        let run_idx = self.run_dirs().context("failed to count run dirs")?.len();

        let run_dir = self.sim_dir.join(format!("run-{run_idx:04}"));
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        Ok(run_dir)
    }

    fn run_dirs(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let run_dirs = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .collect();
        Ok(run_dirs)
    }
}

fn save_report<P: AsRef<Path>, T: Serialize>(file: P, report: &T) -> Result<()> {
    let file = file.as_ref();
    let writer = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
    let mut writer = BufWriter::new(writer);

    encode::write_named(&mut writer, report).context("failed to serialize report")?;

    writer.flush().context("failed to flush writer stream")?;
    log::info!("saved {file:?}");

    Ok(())
}
