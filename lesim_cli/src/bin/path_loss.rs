//! Tabulates the path loss of every propagation model over distance, at a fixed device altitude.

use std::{
    fs::File,
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use lesimcore::{
    propagation::{CLOSED_FORM_MODELS, PretrainedRegressor, PropagationModel, closed_form_by_name},
    units::{Dbm, Length},
};
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// CSV file to write, stdout if not given
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pretrained regressor files to include
    #[arg(long)]
    regressor: Option<Vec<PathBuf>>,

    #[arg(long, default_value_t = 0.0)]
    tx_power: f64,

    /// Device altitude in metres
    #[arg(long, default_value_t = 60.0)]
    altitude: f64,

    /// Distances in metres
    #[arg(long, default_value_t = 250.0)]
    step: f64,
    #[arg(long, default_value_t = 10000.0)]
    max_distance: f64,

    /// Keep the shadowing of the log distance model instead of its mean
    #[arg(long)]
    shadowing: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Debug, Serialize)]
struct Row {
    model: String,
    distance_m: f64,
    /// Empty when the model can not give a value.
    rss_dbm: Option<f64>,
    path_loss_db: Option<f64>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    if !args.step.is_finite() || args.step <= 0.0 {
        tracing::error!("Step must be positive");
        return ExitCode::FAILURE;
    }

    let mut models: Vec<PropagationModel> = CLOSED_FORM_MODELS
        .iter()
        .filter_map(|name| match *name {
            "LogShadow" if !args.shadowing => closed_form_by_name("logshadow-deterministic"),
            name => closed_form_by_name(name),
        })
        .collect();

    for path in args.regressor.into_iter().flatten() {
        match PretrainedRegressor::load(path.clone()) {
            Ok(regressor) => models.push(regressor.into()),
            Err(e) => {
                tracing::error!("Could not load {path:?}: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let tx_power = Dbm::from_dbm(args.tx_power);
    let altitude = Length::from_metres(args.altitude);

    let mut rows = Vec::new();
    for model in &models {
        let mut rng = ChaCha12Rng::seed_from_u64(args.seed);

        let mut distance = args.step;
        while distance <= args.max_distance {
            let rss = model
                .tp_to_rss(
                    &mut rng,
                    false,
                    tx_power,
                    Length::from_metres(distance),
                    altitude,
                )
                .map(|x| x.dbm());

            if let Err(e) = &rss {
                tracing::warn!("{} at {distance} m: {e}", model.name());
            }

            rows.push(Row {
                model: model.name().to_owned(),
                distance_m: distance,
                rss_dbm: rss.as_ref().ok().copied(),
                path_loss_db: rss.ok().map(|x| args.tx_power - x),
            });

            distance += args.step;
        }
    }

    match write_rows(args.output, &rows) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Could not write table: {e}");
            ExitCode::FAILURE
        }
    }
}

fn write_rows(maybe_path: Option<PathBuf>, rows: &[Row]) -> Result<(), csv::Error> {
    let write = if let Some(out_path) = maybe_path {
        Box::new(File::create(out_path)?) as Box<dyn Write>
    } else {
        Box::new(io::stdout())
    };

    let mut writer = csv::Writer::from_writer(write);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    Ok(())
}
