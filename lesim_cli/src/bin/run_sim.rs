//! The simulator cli.

use std::{
    error::Error,
    fs::{create_dir_all, read_dir},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use clap::Parser;
use lesimcore::{
    propagation::{CLOSED_FORM_MODELS, PretrainedRegressor, PropagationModel, closed_form_by_name},
    scenario::{Scenario, ScenarioIdentity},
    sim_file::{self, load_file},
    simulation::run_simulation,
    units::HOURS,
};
use rand::{Rng, rng};
use rayon::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    quiet: bool,

    /// Scenario file or directory containing scenario files.
    /// Scenario identities are accepted too.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// File name for output or folder to put replica outputs into
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seed for the rng. A random seed will be used for each replica if not specified
    #[arg(long)]
    seed: Option<u64>,

    /// Closed form propagation models to run, by name
    #[arg(long)]
    model: Option<Vec<String>>,

    /// Pretrained regressor files to run as extra propagation models
    #[arg(long)]
    regressor: Option<Vec<PathBuf>>,

    /// Overrides `--model` option if set.
    /// Will run with all closed form models.
    #[arg(short, long)]
    all_models: bool,

    /// Replaces the scenario's horizon
    #[arg(long)]
    horizon_days: Option<f64>,

    /// Leave the event log out of the outputs
    #[arg(long)]
    no_logs: bool,

    /// Show timing information
    #[arg(long)]
    time: bool,

    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let input_path = args.input.unwrap_or("scenario.sim".into());
    let use_rmp = !args.json;
    let extension = if use_rmp { "rmp" } else { "json" };

    let models = match model_list(args.all_models, args.model, args.regressor) {
        Ok(models) => models,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut scenarios = Vec::new();
    if input_path.is_dir() {
        let entries = match read_dir(&input_path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("{e}");
                return ExitCode::FAILURE;
            }
        };

        for thing in entries {
            let file = match thing {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!("{e}");
                    continue;
                }
            };

            match load_scenario(&file.path()) {
                Ok(scenario) => scenarios.push((file_label(&file.path()), scenario)),
                Err(e) => tracing::warn!("Skipping {:?}: {e}", file.path()),
            }
        }
    } else {
        match load_scenario(&input_path) {
            Ok(scenario) => scenarios.push((file_label(&input_path), scenario)),
            Err(e) => {
                tracing::error!("Could not load {input_path:?}: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if let Some(days) = args.horizon_days {
        for (_, scenario) in scenarios.iter_mut() {
            scenario.settings.horizon = days * 24.0 * HOURS;
        }
    }

    let jobs: Vec<(String, Scenario, PropagationModel)> = scenarios
        .iter()
        .flat_map(|(label, scenario)| {
            models
                .iter()
                .map(|model| (label.clone(), scenario.clone(), model.clone()))
        })
        .collect();

    let single_output = jobs.len() == 1 && !args.output.as_ref().is_some_and(|x| x.is_dir());
    let output_path = args.output.unwrap_or_else(|| {
        if single_output {
            format!("replica_output.{extension}").into()
        } else {
            "outputs".into()
        }
    });

    if !single_output {
        if let Err(e) = create_dir_all(&output_path) {
            tracing::error!("Could not create {output_path:?}: {e}");
            return ExitCode::FAILURE;
        }
    }

    let timer = args.time.then(Instant::now);
    let count = AtomicU64::new(0);
    let failures = AtomicU64::new(0);
    let do_logs = !args.no_logs;

    jobs.into_par_iter().for_each(|(label, scenario, model)| {
        let random_seed = args.seed.unwrap_or_else(|| rng().random());
        let scenario_name = scenario.name.clone();
        let model_name = model.name().to_owned();

        tracing::info!("Running {scenario_name} with {model_name} (seed {random_seed})");

        let output = match run_simulation(random_seed, scenario, model, do_logs) {
            Ok(output) => output,
            Err(e) => {
                failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Replica {scenario_name} with {model_name} failed: {e}");
                return;
            }
        };
        count.fetch_add(1, Ordering::Relaxed);

        let out = if single_output {
            output_path.clone()
        } else {
            output_path.join(format!("output_{label}_{model_name}.{extension}"))
        };

        tracing::info!("Writing output to {out:?}");

        if let Err(e) = sim_file::write_file(out, &output, use_rmp) {
            failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Could not write output of {scenario_name} with {model_name}: {e}");
        }
    });

    if let Some(timer) = timer {
        let final_count = count.load(Ordering::Relaxed);
        let final_time = timer.elapsed().as_secs_f32();
        println!(
            "Ran {final_count} replicas in {:.4}s ({} replicas / s)",
            final_time,
            final_count as f32 / final_time
        )
    }

    if failures.load(Ordering::Relaxed) > 0 {
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn model_list(
    all_models: bool,
    names: Option<Vec<String>>,
    regressors: Option<Vec<PathBuf>>,
) -> Result<Vec<PropagationModel>, String> {
    let names = if all_models {
        CLOSED_FORM_MODELS.iter().map(|x| x.to_string()).collect()
    } else if let Some(names) = names {
        names
    } else if regressors.is_some() {
        Vec::new()
    } else {
        vec!["LogShadow".to_owned()]
    };

    let mut models = names
        .iter()
        .map(|name| closed_form_by_name(name).ok_or_else(|| format!("Unknown model {name}")))
        .collect::<Result<Vec<_>, _>>()?;

    // Loaded once, every replica clones the parsed trees.
    for path in regressors.into_iter().flatten() {
        let regressor = PretrainedRegressor::load(path.clone())
            .map_err(|e| format!("Could not load regressor {path:?}: {e}"))?;
        models.push(regressor.into());
    }

    Ok(models)
}

fn file_label(path: &Path) -> String {
    path.file_stem()
        .map(|x| x.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scenario".to_owned())
}

/// Loads a scenario, or a scenario identity that is then regenerated.
fn load_scenario(path: &Path) -> Result<Scenario, Box<dyn Error>> {
    let err = match load_file::<Scenario>(path.to_path_buf()) {
        Ok(scenario) => return Ok(scenario),
        Err(err) => err,
    };

    match load_file::<ScenarioIdentity>(path.to_path_buf()) {
        Ok(identity) => Ok(identity.create()?),
        Err(_) => Err(err.into()),
    }
}
