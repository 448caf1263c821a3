use std::collections::BTreeMap;

use crate::{
    gateway::GatewayCounters,
    node::PhaseRecord,
    sim_file::{DeviceOutput, OutputIdentity, ReplicaOutput},
    simulation::{
        air_interface::AirCounters,
        data_structs::{FrameOutcome, FrameRecord, LogContent, LogItem, LogSource},
    },
    units::*,
};

pub struct CompleteAnalysis {
    pub devices: Vec<DeviceOutput>,

    /// Log items for each device.
    /// Outer vec is devices (index is device id).
    pub node_events: Vec<Vec<LogItem>>,

    /// Log items with [`LogSource::Simulation`] or [`LogSource::Gateway`].
    pub sim_events: Vec<LogItem>,

    // Frame outcome breakdown
    pub frames_sent: usize,
    pub frames_received: usize,
    pub frames_collided: usize,
    pub frames_weak: usize,
    /// Still on air when the horizon was reached.
    pub frames_unresolved: usize,

    /// Frames ordered by start time.
    pub frames: Vec<FrameRecord>,

    /// Sum of the air time of all frames in seconds.
    pub total_airtime: f64,

    pub delivery: DeliveryAnalysis,
    pub energy: EnergyAnalysis,

    /// Number of devices using each spreading factor when the replica ended.
    pub final_spreading_factors: BTreeMap<u8, usize>,

    pub gateway: GatewayCounters,
    pub air: AirCounters,
    pub phase_logs: Vec<Vec<PhaseRecord>>,

    pub horizon: Time,
    pub payload_size: u32,
    pub duty_cycle_window: Time,
    /// Seconds of wall clock the replica took.
    pub wall_clock: f64,

    pub complete_identity: OutputIdentity,
}

impl CompleteAnalysis {
    pub fn new(results: ReplicaOutput) -> CompleteAnalysis {
        let device_count = results.devices.len();

        let mut node_events = vec![Vec::new(); device_count];
        let mut sim_events = Vec::new();

        for event in results.logs {
            match event.source {
                LogSource::Simulation | LogSource::Gateway => sim_events.push(event),
                LogSource::Node(node_id) => match node_events.get_mut(node_id) {
                    Some(list) => list.push(event),
                    None => tracing::warn!(node_id, "log item from unknown device"),
                },
            }
        }

        sim_events.sort_by(|x, y| x.time.total_cmp(&y.time));
        node_events
            .iter_mut()
            .for_each(|list| list.sort_by(|x, y| x.time.total_cmp(&y.time)));

        let mut frames = results.frames;
        frames.sort_by(|x, y| x.start_time.total_cmp(&y.start_time).then(x.id.cmp(&y.id)));

        let (frames_received, frames_collided, frames_weak, frames_unresolved) = frames
            .iter()
            .fold((0, 0, 0, 0), |(a, b, c, d), frame| match frame.outcome {
                Some(FrameOutcome::Received) => (a + 1, b, c, d),
                Some(FrameOutcome::Collided) => (a, b + 1, c, d),
                Some(FrameOutcome::Weak) => (a, b, c + 1, d),
                None => (a, b, c, d + 1),
            });

        let total_airtime = frames.iter().map(|x| x.air_time.seconds()).sum::<f64>();

        let delivery = DeliveryAnalysis::new(&results.devices, &frames);
        let energy = EnergyAnalysis::new(&results.devices);

        let mut final_spreading_factors = BTreeMap::new();
        for device in &results.devices {
            *final_spreading_factors
                .entry(device.spreading_factor)
                .or_insert(0) += 1;
        }

        CompleteAnalysis {
            devices: results.devices,
            node_events,
            sim_events,
            frames_sent: frames.len(),
            frames_received,
            frames_collided,
            frames_weak,
            frames_unresolved,
            frames,
            total_airtime,
            delivery,
            energy,
            final_spreading_factors,
            gateway: results.gateway,
            air: results.air,
            phase_logs: results.phase_logs,
            horizon: results.horizon,
            payload_size: results.payload_size,
            duty_cycle_window: results.duty_cycle_window,
            wall_clock: results.wall_clock.as_secs_f64(),
            complete_identity: results.complete_identity,
        }
    }

    /// Number of sim events of each kind, keyed by a short label.
    pub fn sim_event_breakdown(&self) -> BTreeMap<&'static str, usize> {
        let mut breakdown = BTreeMap::new();

        for event in &self.sim_events {
            let label = match event.content {
                LogContent::Text(_) => "text",
                LogContent::FrameSent { .. } => "sent",
                LogContent::FrameReceived { .. } => "received",
                LogContent::FrameCollided { .. } => "collided",
                LogContent::FrameWeak { .. } => "weak",
                LogContent::AckScheduled { .. } => "ack_scheduled",
                LogContent::AckDelivered { .. } => "ack_delivered",
                LogContent::AckDropped { .. } => "ack_dropped",
                LogContent::AdrApplied { .. } => "adr",
                LogContent::DutyCycleDeferral { .. } => "deferral",
                LogContent::RetryExhausted { .. } => "exhausted",
            };
            *breakdown.entry(label).or_insert(0) += 1;
        }

        breakdown
    }
}

/// Packet level statistics summed over all devices.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAnalysis {
    pub unique_packets: u32,
    pub packets_lost: u32,
    pub retransmissions: u32,
    pub transmissions: u32,

    /// Delivered packets over packets that reached a final state.
    /// `None` if no packet finished.
    pub packet_delivery_ratio: Option<f64>,
    /// Share of resolved frames that collided.
    pub collision_rate: Option<f64>,
    /// Share of resolved frames that were too weak.
    pub weak_rate: Option<f64>,
    /// Retransmissions per packet that reached a final state.
    pub mean_retransmissions: Option<f64>,
}

impl DeliveryAnalysis {
    pub fn new(devices: &[DeviceOutput], frames: &[FrameRecord]) -> DeliveryAnalysis {
        let unique_packets: u32 = devices.iter().map(|x| x.counters.unique_packets_sent).sum();
        let packets_lost: u32 = devices.iter().map(|x| x.counters.packets_lost).sum();
        let retransmissions: u32 = devices.iter().map(|x| x.counters.retransmissions).sum();
        let transmissions: u32 = devices.iter().map(|x| x.counters.transmissions).sum();

        let finished = unique_packets + packets_lost;
        let ratio = |top: f64, bottom: f64| (bottom > 0.0).then(|| top / bottom);

        let resolved = frames.iter().filter(|x| x.outcome.is_some()).count();
        let outcome_rate = |outcome: FrameOutcome| {
            let count = frames.iter().filter(|x| x.outcome == Some(outcome)).count();
            ratio(count as f64, resolved as f64)
        };

        DeliveryAnalysis {
            unique_packets,
            packets_lost,
            retransmissions,
            transmissions,
            packet_delivery_ratio: ratio(unique_packets as f64, finished as f64),
            collision_rate: outcome_rate(FrameOutcome::Collided),
            weak_rate: outcome_rate(FrameOutcome::Weak),
            mean_retransmissions: ratio(retransmissions as f64, finished as f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyAnalysis {
    pub total: Energy,
    pub mean_per_device: Option<Energy>,
    /// Mean over devices that delivered at least one packet.
    pub mean_per_bit: Option<Energy>,
    pub max_device: Option<Energy>,
    pub transmit_share: Option<f64>,
}

impl EnergyAnalysis {
    pub fn new(devices: &[DeviceOutput]) -> EnergyAnalysis {
        let total: Energy = devices.iter().map(|x| x.total_energy).sum();
        let transmit: Energy = devices.iter().map(|x| x.energy.transmit).sum();

        let mean_per_device = (!devices.is_empty()).then(|| total / devices.len() as f64);

        let per_bit: Vec<Energy> = devices.iter().filter_map(|x| x.energy_per_bit).collect();
        let mean_per_bit = (!per_bit.is_empty())
            .then(|| per_bit.iter().copied().sum::<Energy>() / per_bit.len() as f64);

        let max_device = devices
            .iter()
            .map(|x| x.total_energy)
            .max_by(|a, b| a.joules().total_cmp(&b.joules()));

        EnergyAnalysis {
            total,
            mean_per_device,
            mean_per_bit,
            max_device,
            transmit_share: (total > Energy::ZERO).then(|| transmit / total),
        }
    }
}
