use std::{collections::VecDeque, time::Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use thiserror::Error;

use crate::{
    gateway::Gateway,
    node::{Node, NodeContext, NodeEffect, NodeEvent, NodeSettings},
    propagation::{ModelError, PropagationModel},
    radio::ConfigurationError,
    scenario::Scenario,
    sim_file::{DeviceOutput, OutputIdentity, ReplicaOutput},
    units::*,
};

use air_interface::{AirInterface, SubmitError};
use data_structs::{
    Downlink, FrameOutcome, LogContent, LogItem, LogLevel, LogSource, SimAction,
};
use scheduler::Scheduler;

pub mod air_interface;
pub mod data_structs;
pub mod scheduler;

pub const SIM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Conditions that stop a replica. Every other replica is unaffected.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Runs one replica of `scenario` to its horizon.
pub fn run_simulation(
    random_seed: u64,
    scenario: Scenario,
    propagation: PropagationModel,
    do_logs: bool,
) -> Result<ReplicaOutput, SimulationError> {
    let started = Instant::now();

    let complete_identity = OutputIdentity {
        scenario_identity: scenario.identity.clone(),
        scenario_name: scenario.name.clone(),
        propagation_model: propagation.name().to_owned(),
        simulation_seed: random_seed,
        sim_version: SIM_VERSION.to_owned(),
    };
    let duty_cycle_window = scenario.settings.duty_cycle_window;

    tracing::debug!(
        scenario = %complete_identity.scenario_name,
        model = %complete_identity.propagation_model,
        seed = random_seed,
        devices = scenario.devices.len(),
        "starting replica"
    );

    let mut sim = Simulation::new(random_seed, scenario, propagation, do_logs)?;

    while !sim.finished() {
        sim.step()?;
    }

    let payload_size = sim.node_settings.payload_size;

    let devices = sim
        .nodes
        .iter()
        .map(|node| DeviceOutput {
            id: node.id(),
            location: *node.location(),
            counters: node.counters().clone(),
            energy: node.energy().clone(),
            total_energy: node.total_energy(),
            energy_per_bit: node.energy_per_bit(payload_size),
            spreading_factor: node.radio().spreading_factor(),
            tx_power: node.radio().tx_power(),
        })
        .collect();

    let phase_logs = if sim.node_settings.do_phase_logs {
        sim.nodes.iter_mut().map(|x| x.take_phase_log()).collect()
    } else {
        Vec::new()
    };

    let frames = sim.air.finish();
    let wall_clock = started.elapsed();

    tracing::debug!(
        frames = frames.len(),
        seconds = wall_clock.as_secs_f64(),
        "replica finished"
    );

    Ok(ReplicaOutput {
        devices,
        gateway: sim.gateway.counters().clone(),
        air: sim.air.counters().clone(),
        frames,
        logs: sim.logs,
        phase_logs,
        horizon: sim.horizon,
        payload_size,
        duty_cycle_window,
        wall_clock,
        complete_identity,
    })
}

#[derive(Debug, Clone)]
pub struct Simulation {
    pub sim_time: Time,
    horizon: Time,
    scheduler: Scheduler,
    nodes: Vec<Node>,
    node_settings: NodeSettings,
    air: AirInterface,
    gateway: Gateway,
    next_frame_id: u32,
    finished: bool,

    pub logs: Vec<LogItem>,

    // Output Detail
    do_logs: bool,

    rng: ChaCha12Rng,
}

/// Used to create a NodeContext object.
/// `let mut context = context!(self);`
#[macro_export]
macro_rules! context {
    ($sim: expr) => {{
        NodeContext {
            now: $sim.sim_time,
            rng: &mut $sim.rng,
            settings: &$sim.node_settings,
            next_frame_id: &mut $sim.next_frame_id,
            logs: &mut $sim.logs,
            do_logs: $sim.do_logs,
        }
    }};
}

impl Simulation {
    /// Builds a replica and wakes every device for the first time.
    pub fn new(
        random_seed: u64,
        scenario: Scenario,
        propagation: PropagationModel,
        do_logs: bool,
    ) -> Result<Simulation, SimulationError> {
        scenario.validate()?;
        let radios = scenario.device_radios()?;
        let settings = scenario.settings;

        let nodes = scenario
            .devices
            .iter()
            .zip(radios)
            .enumerate()
            .map(|(id, (device, radio))| Node::new(id, device.location, radio))
            .collect();

        let air = AirInterface::new(
            propagation,
            settings.snr_model.clone(),
            scenario.gateway,
            settings.capture_margin,
            settings.duty_cycle_window,
        );

        let mut sim = Simulation {
            sim_time: Time::ZERO,
            horizon: settings.horizon,
            scheduler: Scheduler::new(),
            nodes,
            node_settings: settings.node.clone(),
            air,
            gateway: Gateway::new(scenario.gateway, settings.gateway.clone()),
            next_frame_id: 0,
            finished: false,
            logs: Vec::new(),
            do_logs,
            rng: ChaCha12Rng::seed_from_u64(random_seed),
        };

        sim.initialise_nodes(settings.max_start_delay())?;

        Ok(sim)
    }

    fn initialise_nodes(&mut self, max_start_delay: Time) -> Result<(), SimulationError> {
        for node_id in 0..self.nodes.len() {
            let start_delay = if max_start_delay > Time::ZERO {
                max_start_delay.map(|x| self.rng.random_range(0.0..x))
            } else {
                Time::ZERO
            };

            let mut context = context!(self);
            let effects = self.nodes[node_id].initialise(&mut context, start_delay);
            self.apply_effects(node_id, effects)?;
        }

        Ok(())
    }

    /// Returns true once the horizon has been reached.
    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn air(&self) -> &AirInterface {
        &self.air
    }

    /// Processes the next event, or closes the replica when none is due before the horizon.
    pub fn step(&mut self) -> Result<(), SimulationError> {
        if self.finished {
            return Ok(());
        }

        let due = self.scheduler.peek_time().filter(|x| *x < self.horizon);
        let Some(event) = due.and_then(|_| self.scheduler.pop()) else {
            self.finish();
            return Ok(());
        };

        self.sim_time = event.time;

        match event.action {
            SimAction::NodeTimer { node_id, timer } => {
                let mut context = context!(self);
                let (_, effects) = self.nodes[node_id].step(&mut context, NodeEvent::Timer(timer));
                self.apply_effects(node_id, effects)?;
            }
            SimAction::ResolveFrame { frame_id } => self.resolve_frame(frame_id)?,
            SimAction::DeliverDownlink(downlink) => self.deliver(downlink)?,
        }

        Ok(())
    }

    /// Charges every device up to the horizon. Pending events never fire.
    fn finish(&mut self) {
        self.sim_time = self.horizon;

        for node in self.nodes.iter_mut() {
            let mut context = context!(self);
            node.step(&mut context, NodeEvent::Horizon);
        }

        let dropped = self.scheduler.clear();
        tracing::trace!(dropped, "events left at the horizon");

        self.finished = true;
    }

    fn apply_effects(
        &mut self,
        node_id: usize,
        effects: Vec<NodeEffect>,
    ) -> Result<(), SimulationError> {
        let mut queue = VecDeque::from(effects);

        while let Some(effect) = queue.pop_front() {
            match effect {
                NodeEffect::Schedule { at, timer } => {
                    self.scheduler
                        .push(at, SimAction::NodeTimer { node_id, timer });
                }
                NodeEffect::Transmit(frame) => {
                    let frame_id = frame.id;
                    let attempt = frame.attempt;
                    let end_time = frame.end_time();
                    let location = *self.nodes[node_id].location();

                    match self.air.submit(&mut self.rng, frame, &location) {
                        Ok(()) => {
                            self.scheduler
                                .push(end_time, SimAction::ResolveFrame { frame_id });
                            self.log_content(
                                LogSource::Node(node_id),
                                LogContent::FrameSent { frame_id, attempt },
                                LogLevel::Debug,
                            );
                        }
                        Err(SubmitError::Node(error)) => {
                            let mut context = context!(self);
                            let (_, effects) =
                                self.nodes[node_id].step(&mut context, NodeEvent::Rejected(error));
                            queue.extend(effects);
                        }
                        Err(SubmitError::Model(error)) => return Err(error.into()),
                    }
                }
            }
        }

        Ok(())
    }

    fn resolve_frame(&mut self, frame_id: u32) -> Result<(), SimulationError> {
        let Some(resolution) = self.air.resolve(frame_id)? else {
            return Ok(());
        };

        match resolution.outcome {
            FrameOutcome::Collided => {
                let interferer_id = resolution.interferer.unwrap_or(frame_id);
                self.log_content(
                    LogSource::Simulation,
                    LogContent::FrameCollided {
                        frame_id,
                        interferer_id,
                    },
                    LogLevel::Debug,
                );
            }
            FrameOutcome::Weak => {
                self.log_content(
                    LogSource::Simulation,
                    LogContent::FrameWeak {
                        frame_id,
                        snr: resolution.snr,
                    },
                    LogLevel::Debug,
                );
            }
            FrameOutcome::Received => {
                self.log_content(
                    LogSource::Gateway,
                    LogContent::FrameReceived {
                        frame_id,
                        snr: resolution.snr,
                    },
                    LogLevel::Info,
                );

                let Some(ack) = self.gateway.receive(&resolution.frame, resolution.snr)? else {
                    return Ok(());
                };

                match self
                    .air
                    .schedule_ack(ack, &resolution.frame, &self.node_settings.timing)
                {
                    Some(downlink) => {
                        self.log_content(
                            LogSource::Gateway,
                            LogContent::AckScheduled {
                                frame_id,
                                window: downlink.window,
                            },
                            LogLevel::Debug,
                        );
                        self.scheduler
                            .push(downlink.start_time, SimAction::DeliverDownlink(downlink));
                    }
                    None => self.log_content(
                        LogSource::Gateway,
                        LogContent::AckDropped { frame_id },
                        LogLevel::Info,
                    ),
                }
            }
        }

        Ok(())
    }

    fn deliver(&mut self, downlink: Downlink) -> Result<(), SimulationError> {
        let node_id = downlink.ack.device_id;

        if !self.nodes[node_id].accepts_downlink(downlink.window) {
            self.air.ack_missed();
            self.log_content(
                LogSource::Node(node_id),
                LogContent::AckDropped {
                    frame_id: downlink.ack.frame_id,
                },
                LogLevel::Info,
            );
            return Ok(());
        }

        let mut context = context!(self);
        let (_, effects) = self.nodes[node_id].step(&mut context, NodeEvent::Downlink(downlink));
        self.apply_effects(node_id, effects)
    }

    fn log_content(&mut self, source: LogSource, content: LogContent, level: LogLevel) {
        if self.do_logs {
            self.logs.push(LogItem {
                time: self.sim_time,
                log_level: level,
                source,
                content,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assert_close,
        gateway::GatewaySettings,
        location::Location,
        node::InterArrival,
        propagation::{FreeSpace, LogShadow},
        radio::{DEFAULT_CHANNELS, RadioSettings},
        scenario::{Device, ScenarioIdentity, ScenarioSettings},
    };

    /// Devices at the given distances east of the gateway, all on the first channel.
    fn scenario(distances: &[f64], spreading_factor: u8) -> Scenario {
        let devices = distances
            .iter()
            .map(|x| Device {
                location: Location::outdoor(Length::from_metres(*x), 0.0 * KM),
                radio: RadioSettings {
                    frequency: DEFAULT_CHANNELS[0],
                    spreading_factor,
                    ..Default::default()
                },
            })
            .collect();

        let mut settings = ScenarioSettings {
            horizon: 6.0 * HOURS,
            ..Default::default()
        };
        settings.node.do_phase_logs = true;

        Scenario {
            identity: ScenarioIdentity::Custom,
            name: "test".to_owned(),
            gateway: Location::outdoor(0.0 * KM, 0.0 * KM),
            devices,
            settings,
        }
    }

    fn deterministic() -> PropagationModel {
        LogShadow::default().without_shadowing().into()
    }

    #[test]
    fn sf7_at_1000m_is_reproducible() {
        let mut scenario = scenario(&[1000.0], 7);
        scenario.settings.node.adr_enabled = false;

        let first = run_simulation(5, scenario.clone(), deterministic(), true).unwrap();
        let second = run_simulation(5, scenario, deterministic(), true).unwrap();

        assert!(!first.frames.is_empty());
        assert_eq!(first.frames.len(), second.frames.len());

        for (a, b) in first.frames.iter().zip(second.frames.iter()) {
            assert_eq!(a.start_time, b.start_time);
            assert_eq!(a.rss, b.rss);
            assert_eq!(a.outcome, b.outcome);
            assert_close(a.rss.dbm(), 14.0 - 128.95);
        }

        assert!(
            first
                .frames
                .iter()
                .all(|x| matches!(x.outcome, Some(FrameOutcome::Received) | None))
        );

        let device = &first.devices[0];
        assert_eq!(device.counters.retransmissions, 0);
        assert_eq!(device.counters.packets_lost, 0);
        assert_eq!(device.counters.acks_received, device.counters.unique_packets_sent);
        assert_eq!(device.total_energy, second.devices[0].total_energy);
        assert_eq!(first.complete_identity.propagation_model, "LogShadow");
    }

    #[test]
    fn equal_strength_frames_both_collide() {
        let mut scenario = scenario(&[1000.0, 1000.0], 7);
        scenario.settings.horizon = 30.0 * MINS;
        scenario.settings.max_start_delay = Some(Time::ZERO);
        scenario.settings.node.confirmed = false;
        scenario.settings.node.adr_enabled = false;
        scenario.settings.node.inter_arrival = InterArrival::Fixed(HOURS);

        let output = run_simulation(1, scenario, deterministic(), true).unwrap();

        assert_eq!(output.frames.len(), 2);
        assert!(
            output
                .frames
                .iter()
                .all(|x| x.outcome == Some(FrameOutcome::Collided))
        );
        assert_eq!(output.air.collided, 2);
        assert_eq!(output.gateway.packets_received, 0);
        assert!(output.logs.iter().any(|x| matches!(
            x.content,
            LogContent::FrameCollided { .. }
        )));
    }

    #[test]
    fn withheld_acks_retry_then_lose_the_packet() {
        // Far enough that every frame is too weak for the gateway to hear.
        let mut scenario = scenario(&[10_000.0], 7);
        scenario.settings.horizon = 30.0 * MINS;
        scenario.settings.max_start_delay = Some(Time::ZERO);
        scenario.settings.node.max_retransmissions = 3;
        scenario.settings.node.inter_arrival = InterArrival::Fixed(HOURS);

        let output = run_simulation(2, scenario, deterministic(), true).unwrap();
        let counters = &output.devices[0].counters;

        assert_eq!(counters.transmissions, 4);
        assert_eq!(counters.retransmissions, 3);
        assert_eq!(counters.packets_lost, 1);
        assert_eq!(counters.unique_packets_sent, 0);
        assert_eq!(output.air.weak, 4);
        assert_eq!(output.gateway.packets_received, 0);
    }

    #[test]
    fn adr_moves_device_to_fastest_rate_with_margin() {
        let mut scenario = scenario(&[1000.0], 12);
        scenario.settings.horizon = 48.0 * HOURS;
        scenario.settings.node.inter_arrival = InterArrival::Fixed(HOURS);

        let output = run_simulation(3, scenario, deterministic(), false).unwrap();
        let device = &output.devices[0];

        // About 2 dB of SNR clears SF8 with a 10 dB margin but not SF7.
        assert_eq!(device.spreading_factor, 8);
        assert_eq!(device.tx_power, 14);
        assert_eq!(device.counters.adr_commands_applied, 1);
        assert_eq!(output.gateway.adr_commands, 1);
        assert!(output.logs.is_empty());
    }

    #[test]
    fn adr_settles_under_shadowing() {
        let mut scenario = scenario(&[1000.0], 7);
        scenario.settings.horizon = 48.0 * HOURS;
        scenario.settings.node.inter_arrival = InterArrival::Fixed(HOURS);

        let output = run_simulation(9, scenario, LogShadow::default().into(), false).unwrap();
        let device = &output.devices[0];
        let window = GatewaySettings::default().adr_min_samples as u32;

        // Each command needs a fresh window of heard frames.
        assert!(output.gateway.packets_received >= window);
        assert!(output.gateway.adr_commands >= 1);
        assert!(output.gateway.adr_commands * window <= output.gateway.packets_received);
        assert!(device.counters.adr_commands_applied <= output.gateway.adr_commands);

        let changes = output
            .frames
            .windows(2)
            .filter(|x| x[0].spreading_factor != x[1].spreading_factor)
            .count() as u32;
        assert!(changes <= output.gateway.adr_commands);
    }

    #[test]
    fn phase_logs_add_up_to_device_energy() {
        let scenario = scenario(&[500.0, 1500.0, 3000.0], 9);

        let output = run_simulation(4, scenario, deterministic(), false).unwrap();

        assert_eq!(output.phase_logs.len(), 3);
        for (device, phases) in output.devices.iter().zip(output.phase_logs.iter()) {
            let logged: Energy = phases.iter().map(|x| x.energy).sum();
            assert_close(logged.joules(), device.total_energy.joules());
            assert_close(device.energy.total().joules(), device.total_energy.joules());
        }
    }

    #[test]
    fn indoor_device_fails_outdoor_only_model() {
        let mut scenario = scenario(&[1000.0], 7);
        scenario.devices[0].location.indoor = true;
        scenario.settings.max_start_delay = Some(Time::ZERO);

        let result = run_simulation(0, scenario, FreeSpace::default().into(), false);
        assert!(matches!(
            result,
            Err(SimulationError::Model(ModelError::IndoorUnsupported { .. }))
        ));
    }

    #[test]
    fn invalid_scenario_never_starts() {
        let scenario = scenario(&[1000.0], 13);

        let result = Simulation::new(0, scenario, deterministic(), false);
        assert!(matches!(
            result,
            Err(SimulationError::Configuration(
                ConfigurationError::SpreadingFactor(13)
            ))
        ));
    }
}
