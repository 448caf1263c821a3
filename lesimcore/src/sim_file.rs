use rmp_serde::{decode, encode};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::PathBuf,
    time::Duration,
};
use thiserror::Error;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    gateway::GatewayCounters,
    location::Location,
    node::{EnergyBreakdown, NodeCounters, PhaseRecord},
    propagation::ModelError,
    scenario::ScenarioIdentity,
    simulation::{
        air_interface::AirCounters,
        data_structs::{FrameRecord, LogItem},
    },
    units::*,
};

#[derive(Debug, Error)]
pub enum SimFileError {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    RMPWriteError(#[from] encode::Error),
    #[error(transparent)]
    RMPReadError(#[from] decode::Error),
    #[error(transparent)]
    ModelError(#[from] ModelError),
}

/// Reads a JSON file, falling back to MessagePack when the content is not JSON.
pub fn load_file<T>(path: PathBuf) -> Result<T, SimFileError>
where
    T: DeserializeOwned,
{
    use serde_json::error::Category;

    let file = File::open(&path)?;
    let buf_reader = BufReader::new(file);

    let json_result: Result<T, _> = serde_json::from_reader(buf_reader);

    json_result.or_else(|err| match err.classify() {
        Category::Io | Category::Eof => Err(err.into()),
        _ => {
            let file = File::open(path)?;
            let buf_reader = BufReader::new(file);
            let res: Result<T, _> = decode::from_read(buf_reader);
            res.map_err(|x| x.into())
        }
    })
}

pub fn write_file<T>(path: PathBuf, object: &T, use_rmp: bool) -> Result<(), SimFileError>
where
    T: Serialize,
{
    let file = File::create(path)?;
    let mut buf = BufWriter::new(file);

    if use_rmp {
        encode::write(&mut buf, object)?;
    } else {
        serde_json::to_writer_pretty(buf, object)?;
    }

    Ok(())
}

/// Contains enough information to completely recreate the replica it describes.
/// Unless a custom (i.e. hand created) scenario was used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputIdentity {
    pub scenario_identity: ScenarioIdentity,
    pub scenario_name: String,
    pub propagation_model: String,
    pub simulation_seed: u64,
    pub sim_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOutput {
    pub id: usize,
    pub location: Location,
    pub counters: NodeCounters,
    pub energy: EnergyBreakdown,
    pub total_energy: Energy,
    pub energy_per_bit: Option<Energy>,

    /// Radio settings when the replica ended.
    pub spreading_factor: u8,
    pub tx_power: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaOutput {
    // Data values
    pub devices: Vec<DeviceOutput>,
    pub gateway: GatewayCounters,
    pub air: AirCounters,
    pub frames: Vec<FrameRecord>,
    pub logs: Vec<LogItem>,
    /// Per device, empty unless phase logging was enabled.
    pub phase_logs: Vec<Vec<PhaseRecord>>,

    pub horizon: Time,
    pub payload_size: u32,
    pub duty_cycle_window: Time,
    pub wall_clock: Duration,

    // Regeneration
    pub complete_identity: OutputIdentity,
}

impl ReplicaOutput {
    pub fn total_energy(&self) -> Energy {
        self.devices.iter().map(|x| x.total_energy).sum()
    }
}
