use std::{
    fs::{File, read_dir},
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use lesimcore::{
    analysis::CompleteAnalysis,
    sim_file::{OutputIdentity, ReplicaOutput, load_file},
    verification::verify_all,
};
use rayon::prelude::*;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long)]
    no_verify: bool,

    /// Results file or directory containing results files
    #[arg(short, long)]
    results: Option<PathBuf>,

    /// CSV file to write, stdout if not given
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print a breakdown of every replica to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let results_path = args.results.unwrap_or("replica_output.rmp".into());
    let no_verify = args.no_verify;
    let verbose = args.verbose;

    let simulations = load_result_files(results_path);
    if simulations.is_empty() {
        tracing::error!("No replica outputs found");
        return ExitCode::FAILURE;
    }

    let mut table: Vec<TableEntry> = simulations
        .into_par_iter()
        .map(|x| make_table_entry(no_verify, verbose, x))
        .collect();

    table.sort_by(|x, y| {
        (&x.scenario_name, &x.propagation_model, x.seed).cmp(&(
            &y.scenario_name,
            &y.propagation_model,
            y.seed,
        ))
    });

    let failed_verification = table.iter().any(|x| x.verified == Some(false));

    if let Err(e) = write_table(args.output, &table) {
        tracing::error!("Could not write summary: {e}");
        return ExitCode::FAILURE;
    }

    if failed_verification {
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn write_table(maybe_path: Option<PathBuf>, table: &[TableEntry]) -> Result<(), csv::Error> {
    let write = if let Some(out_path) = maybe_path {
        let file = File::create(out_path)?;
        Box::new(file) as Box<dyn Write>
    } else {
        Box::new(io::stdout())
    };

    let mut writer = csv::Writer::from_writer(write);
    for entry in table {
        writer.serialize(entry)?;
    }
    writer.flush()?;

    Ok(())
}

fn make_table_entry(no_verify: bool, verbose: bool, results: ReplicaOutput) -> TableEntry {
    let analysis = CompleteAnalysis::new(results);

    let OutputIdentity {
        scenario_identity,
        scenario_name,
        propagation_model,
        simulation_seed,
        sim_version,
    } = &analysis.complete_identity;

    let delivery = &analysis.delivery;
    let energy = &analysis.energy;

    let spreading_factors = analysis
        .final_spreading_factors
        .iter()
        .map(|(sf, count)| format!("{sf}:{count}"))
        .collect::<Vec<_>>()
        .join(" ");

    let verified = (!no_verify).then(|| verify_all(&analysis));
    if verified == Some(false) {
        tracing::error!(
            "Verification failed for {:#?}",
            analysis.complete_identity
        );
    }

    if verbose {
        printout(&analysis);
    }

    TableEntry {
        scenario_name: scenario_name.clone(),
        scenario_identity: serde_json::to_string(scenario_identity)
            .unwrap_or_else(|_| "unknown".to_owned()),
        propagation_model: propagation_model.clone(),
        sim_version: sim_version.clone(),
        seed: *simulation_seed,
        devices: analysis.devices.len(),
        horizon_days: analysis.horizon.seconds() / 86400.0,
        payload_size: analysis.payload_size,
        frames_sent: analysis.frames_sent,
        frames_received: analysis.frames_received,
        frames_collided: analysis.frames_collided,
        frames_weak: analysis.frames_weak,
        frames_unresolved: analysis.frames_unresolved,
        total_airtime: analysis.total_airtime,
        unique_packets: delivery.unique_packets,
        packets_lost: delivery.packets_lost,
        retransmissions: delivery.retransmissions,
        packet_delivery_ratio: delivery.packet_delivery_ratio,
        collision_rate: delivery.collision_rate,
        weak_rate: delivery.weak_rate,
        mean_retransmissions: delivery.mean_retransmissions,
        total_energy_j: energy.total.joules(),
        mean_energy_j: energy.mean_per_device.map(|x| x.joules()),
        mean_energy_per_bit_uj: energy.mean_per_bit.map(|x| x.joules() * 1e6),
        transmit_energy_share: energy.transmit_share,
        gateway_packets_received: analysis.gateway.packets_received,
        acks_sent: analysis.gateway.acks_sent,
        adr_commands: analysis.gateway.adr_commands,
        acks_dropped: analysis.air.acks_dropped,
        duty_cycle_rejections: analysis.air.duty_cycle_rejections,
        final_spreading_factors: spreading_factors,
        wall_clock: analysis.wall_clock,
        verified,
    }
}

fn printout(analysis: &CompleteAnalysis) {
    let identity = &analysis.complete_identity;
    eprintln!(
        "== {} / {} (seed {}) ==",
        identity.scenario_name, identity.propagation_model, identity.simulation_seed
    );

    for (label, count) in analysis.sim_event_breakdown() {
        eprintln!("{label:>14}: {count}");
    }

    for device in &analysis.devices {
        let counters = &device.counters;
        eprintln!(
            "device {:>5} | SF{:<2} {:>2} dBm | unique {:>5} lost {:>4} retries {:>5} | {}",
            device.id,
            device.spreading_factor,
            device.tx_power,
            counters.unique_packets_sent,
            counters.packets_lost,
            counters.retransmissions,
            device.total_energy
        );
    }
}

fn load_result_files(results_path: PathBuf) -> Vec<ReplicaOutput> {
    let mut sim_results: Vec<ReplicaOutput> = Vec::new();

    if results_path.is_file() {
        match load_file(results_path) {
            Ok(loaded) => sim_results.push(loaded),
            Err(e) => {
                tracing::error!("{e}");
            }
        }
        return sim_results;
    }

    let entries = match read_dir(results_path) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("{e}");
            return sim_results;
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

        match load_file(file.path()) {
            Ok(loaded) => {
                sim_results.push(loaded);
            }
            Err(e) => {
                tracing::warn!("Skipping {:?}: {e}", file.path());
                continue;
            }
        };
    }

    sim_results
}

#[derive(Debug, Clone, Serialize)]
struct TableEntry {
    scenario_name: String,
    scenario_identity: String,
    propagation_model: String,
    sim_version: String,
    seed: u64,
    devices: usize,
    horizon_days: f64,
    payload_size: u32,
    frames_sent: usize,
    frames_received: usize,
    frames_collided: usize,
    frames_weak: usize,
    frames_unresolved: usize,
    total_airtime: f64,
    unique_packets: u32,
    packets_lost: u32,
    retransmissions: u32,
    packet_delivery_ratio: Option<f64>,
    collision_rate: Option<f64>,
    weak_rate: Option<f64>,
    mean_retransmissions: Option<f64>,
    total_energy_j: f64,
    mean_energy_j: Option<f64>,
    mean_energy_per_bit_uj: Option<f64>,
    transmit_energy_share: Option<f64>,
    gateway_packets_received: u32,
    acks_sent: u32,
    adr_commands: u32,
    acks_dropped: u32,
    duty_cycle_rejections: u32,
    final_spreading_factors: String,
    wall_clock: f64,
    verified: Option<bool>,
}
