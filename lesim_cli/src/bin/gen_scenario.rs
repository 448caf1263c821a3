use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use lesimcore::{
    node::InterArrival,
    radio::RadioSettings,
    scenario::{
        ScenarioIdentity, ScenarioSettings,
        generation::{ScenarioGenerator, StartSpreadingFactor},
    },
    sim_file::{self, load_file},
    units::{HOURS, KM, METRES},
};
use rand::Rng;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    /// Number of end devices
    #[arg(short, long, default_value_t = 100)]
    devices: usize,

    /// Side length of the square cell in km
    #[arg(long, default_value_t = 10.0)]
    cell_size: f64,

    /// Chance each device is placed indoors
    #[arg(long, default_value_t = 0.0)]
    indoor: f64,

    /// Spreading factor every device starts with
    #[arg(long, default_value_t = 7)]
    start_sf: u8,

    /// Start each device at a random spreading factor, overrides `--start-sf`
    #[arg(long)]
    random_sf: bool,

    /// Simulated days before the replica stops
    #[arg(long)]
    horizon_days: Option<f64>,

    /// Application payload in bytes
    #[arg(long)]
    payload: Option<u32>,

    /// Mean time between packets of a device in hours
    #[arg(long)]
    interval_hours: Option<f64>,

    #[arg(long)]
    unconfirmed: bool,

    #[arg(long)]
    no_adr: bool,

    /// Generate from an identity
    #[arg(long)]
    id: Option<PathBuf>,

    /// Generate as an identity
    #[arg(long)]
    asid: bool,

    /// Use JSON instead of rust messagepack
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let seed: u64 = args.seed.unwrap_or_else(|| rand::rng().random());
    let output_file: PathBuf = args.output.unwrap_or("scenario.sim".into());
    let use_rmp = !args.json;

    let identity = if let Some(path) = args.id {
        match load_file::<ScenarioIdentity>(path) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::error!("Could not load identity: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        let mut settings = ScenarioSettings::default();
        if let Some(days) = args.horizon_days {
            settings.horizon = days * 24.0 * HOURS;
        }
        if let Some(payload) = args.payload {
            settings.node.payload_size = payload;
        }
        if let Some(hours) = args.interval_hours {
            settings.node.inter_arrival = InterArrival::Exponential {
                mean: hours * HOURS,
            };
        }
        settings.node.confirmed = !args.unconfirmed;
        settings.node.adr_enabled = !args.no_adr;

        let start_sf = if args.random_sf {
            StartSpreadingFactor::Random
        } else {
            StartSpreadingFactor::Fixed(args.start_sf)
        };

        ScenarioIdentity::Generated {
            generator: ScenarioGenerator::UniformCell {
                device_count: args.devices,
                cell_size: args.cell_size * KM,
                min_altitude: 10.0 * METRES,
                max_altitude: 60.0 * METRES,
                indoor_probability: args.indoor,
                start_sf,
                random_channel: true,
                radio: RadioSettings::default(),
                settings,
            },
            seed,
        }
    };

    let sim = match identity.create().and_then(|x| x.validate().map(|_| x)) {
        Ok(sim) => sim,
        Err(e) => {
            tracing::error!("Could not generate scenario: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = if args.asid {
        sim_file::write_file(output_file.clone(), &sim.identity, use_rmp)
    } else {
        sim_file::write_file(output_file.clone(), &sim, use_rmp)
    };

    if let Err(e) = result {
        tracing::error!("Could not write {output_file:?}: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(devices = sim.devices.len(), "Wrote {output_file:?}");

    ExitCode::SUCCESS
}
