//! The shared radio channel between the devices and the gateway.
//!
//! Every uplink passes through [`AirInterface::submit`], which enforces the
//! transmitter's duty cycle budget and fixes the frame's signal strength at the
//! gateway. The frame is resolved once it has finished on air, against every other
//! frame on the same channel that overlapped it.

use std::collections::{BTreeMap, HashMap, VecDeque};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    calculate_air_time,
    location::Location,
    node::NodeError,
    propagation::{ModelError, PropagationModel},
    radio::{ConfigurationError, ProtocolTiming, duty_cycle_limit},
    snr::{SnrModel, sensitivity},
    units::*,
};

use super::data_structs::{
    Acknowledgement, Downlink, Frame, FrameOutcome, FrameRecord, ReceiveWindow,
};

/// Slack when comparing on air time against a duty cycle budget.
const DUTY_CYCLE_EPSILON: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Transmitter {
    Device(usize),
    Gateway,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AirCounters {
    pub frames_submitted: u32,
    pub collided: u32,
    pub weak: u32,
    pub received: u32,
    pub duty_cycle_rejections: u32,
    pub acks_scheduled: u32,
    pub acks_dropped: u32,
}

#[derive(Debug, Clone)]
struct ActiveFrame {
    frame: Frame,
    rss: Dbm,
    snr: Dbf,
    resolved: bool,
}

impl ActiveFrame {
    fn record(&self, outcome: Option<FrameOutcome>) -> FrameRecord {
        FrameRecord {
            id: self.frame.id,
            device_id: self.frame.device_id,
            frequency: self.frame.frequency(),
            spreading_factor: self.frame.spreading_factor(),
            tx_power: self.frame.tx_power(),
            start_time: self.frame.start_time,
            air_time: self.frame.air_time,
            attempt: self.frame.attempt,
            rss: self.rss,
            snr: self.snr,
            outcome,
        }
    }
}

/// Result of resolving a frame.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub frame: Frame,
    pub outcome: FrameOutcome,
    pub rss: Dbm,
    pub snr: Dbf,
    /// An overlapping frame the target could not capture against.
    pub interferer: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AirInterface {
    propagation: PropagationModel,
    snr_model: SnrModel,
    gateway: Location,
    capture_margin: Dbf,
    duty_cycle_window: Time,

    /// Frames by channel that are unresolved, or that an unresolved frame overlaps.
    channels: BTreeMap<u64, Vec<ActiveFrame>>,
    on_air: HashMap<(Transmitter, u64), VecDeque<(Time, Time)>>,

    records: Vec<FrameRecord>,
    counters: AirCounters,
}

impl AirInterface {
    pub fn new(
        propagation: PropagationModel,
        snr_model: SnrModel,
        gateway: Location,
        capture_margin: Dbf,
        duty_cycle_window: Time,
    ) -> AirInterface {
        AirInterface {
            propagation,
            snr_model,
            gateway,
            capture_margin,
            duty_cycle_window,
            channels: BTreeMap::new(),
            on_air: HashMap::new(),
            records: Vec::new(),
            counters: AirCounters::default(),
        }
    }

    pub fn propagation(&self) -> &PropagationModel {
        &self.propagation
    }

    pub fn counters(&self) -> &AirCounters {
        &self.counters
    }

    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    /// Number of frames still held on any channel.
    pub fn active_frames(&self) -> usize {
        self.channels.values().map(|x| x.len()).sum()
    }

    /// Puts a frame on air at its start time. On success the caller must resolve it
    /// at [`Frame::end_time`].
    pub fn submit<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        frame: Frame,
        device: &Location,
    ) -> Result<(), SubmitError> {
        let transmitter = Transmitter::Device(frame.device_id);

        if let Err(retry_at) = self.check_duty_cycle(
            transmitter,
            frame.frequency(),
            frame.start_time,
            frame.air_time,
        ) {
            self.counters.duty_cycle_rejections += 1;
            return Err(NodeError::DutyCycleViolation { retry_at }.into());
        }

        let rss = self.propagation.tp_to_rss(
            rng,
            device.indoor,
            frame.radio.tx_power_dbm(),
            device.distance_to(&self.gateway),
            device.altitude,
        )?;
        let snr = self.snr_model.snr(rss, frame.bandwidth());

        self.occupy(transmitter, frame.frequency(), frame.start_time, frame.end_time());
        self.counters.frames_submitted += 1;

        self.channels
            .entry(frame.frequency().channel_key())
            .or_default()
            .push(ActiveFrame {
                frame,
                rss,
                snr,
                resolved: false,
            });

        Ok(())
    }

    /// Decides the outcome of a frame that has finished on air.
    /// Returns `None` for a frame that is not registered.
    pub fn resolve(&mut self, frame_id: u32) -> Result<Option<Resolution>, ConfigurationError> {
        let Some((key, index)) = self.find(frame_id) else {
            return Ok(None);
        };
        let Some(frames) = self.channels.get_mut(&key) else {
            return Ok(None);
        };

        let target = &frames[index];

        let mut interferer = None;
        for other in frames.iter() {
            if other.frame.id == frame_id || !other.frame.overlaps(&target.frame) {
                continue;
            }

            if target.rss - other.rss < self.capture_margin {
                interferer = Some(other.frame.id);
                break;
            }
        }

        let threshold = sensitivity(target.frame.spreading_factor(), target.frame.bandwidth())?;

        let outcome = if interferer.is_some() {
            FrameOutcome::Collided
        } else if target.snr < threshold {
            FrameOutcome::Weak
        } else {
            FrameOutcome::Received
        };

        match outcome {
            FrameOutcome::Collided => self.counters.collided += 1,
            FrameOutcome::Weak => self.counters.weak += 1,
            FrameOutcome::Received => self.counters.received += 1,
        }

        frames[index].resolved = true;
        let target = &frames[index];
        self.records.push(target.record(Some(outcome)));

        let resolution = Resolution {
            frame: target.frame.clone(),
            outcome,
            rss: target.rss,
            snr: target.snr,
            interferer,
        };

        prune(frames);
        if frames.is_empty() {
            self.channels.remove(&key);
        }

        Ok(Some(resolution))
    }

    /// Places an acknowledgement in the first receive window the gateway can transmit in.
    /// Returns `None` when neither window is available and the acknowledgement is dropped.
    pub fn schedule_ack(
        &mut self,
        ack: Acknowledgement,
        frame: &Frame,
        timing: &ProtocolTiming,
    ) -> Option<Downlink> {
        let windows = [
            (ReceiveWindow::Rx1, timing.receive_delay1, frame.radio.clone()),
            (ReceiveWindow::Rx2, timing.receive_delay2, frame.radio.rx2()),
        ];

        for (window, delay, radio) in windows {
            let start_time = frame.end_time() + delay;
            let air_time = calculate_air_time(ack.payload_size, &radio);
            let end_time = start_time + air_time;

            if self.gateway_busy(start_time, end_time) {
                continue;
            }
            if self
                .check_duty_cycle(Transmitter::Gateway, radio.frequency(), start_time, air_time)
                .is_err()
            {
                continue;
            }

            self.occupy(Transmitter::Gateway, radio.frequency(), start_time, end_time);
            self.counters.acks_scheduled += 1;

            return Some(Downlink {
                ack,
                window,
                frequency: radio.frequency(),
                spreading_factor: radio.spreading_factor(),
                start_time,
                air_time,
            });
        }

        self.counters.acks_dropped += 1;
        None
    }

    /// Counts an acknowledgement that arrived when its window was already closed.
    pub fn ack_missed(&mut self) {
        self.counters.acks_dropped += 1;
    }

    /// Closes the channel at the end of a replica. Frames still on air are recorded
    /// without an outcome.
    pub fn finish(&mut self) -> Vec<FrameRecord> {
        let channels = std::mem::take(&mut self.channels);

        for frame in channels.into_values().flatten() {
            if !frame.resolved {
                self.records.push(frame.record(None));
            }
        }

        self.records.sort_by_key(|x| x.id);
        std::mem::take(&mut self.records)
    }

    fn find(&self, frame_id: u32) -> Option<(u64, usize)> {
        self.channels.iter().find_map(|(key, frames)| {
            frames
                .iter()
                .position(|x| x.frame.id == frame_id && !x.resolved)
                .map(|index| (*key, index))
        })
    }

    fn gateway_busy(&self, start: Time, end: Time) -> bool {
        self.on_air
            .iter()
            .filter(|((transmitter, _), _)| *transmitter == Transmitter::Gateway)
            .flat_map(|(_, intervals)| intervals.iter())
            .any(|(s, e)| *s < end && start < *e)
    }

    fn occupy(&mut self, transmitter: Transmitter, frequency: Frequency, start: Time, end: Time) {
        self.on_air
            .entry((transmitter, frequency.channel_key()))
            .or_default()
            .push_back((start, end));
    }

    /// Checks a transmission starting at `start` fits the transmitter's budget on a channel.
    /// On failure returns the earliest time it would fit.
    fn check_duty_cycle(
        &mut self,
        transmitter: Transmitter,
        frequency: Frequency,
        start: Time,
        air_time: Time,
    ) -> Result<(), Time> {
        let Some(limit) = duty_cycle_limit(frequency) else {
            return Ok(());
        };
        let Some(intervals) = self.on_air.get_mut(&(transmitter, frequency.channel_key())) else {
            return Ok(());
        };

        let window_start = start - self.duty_cycle_window;
        intervals.retain(|(_, end)| *end > window_start);

        // A frame longer than the whole budget can only go on an idle channel.
        if intervals.is_empty() {
            return Ok(());
        }

        let budget = self.duty_cycle_window * limit;

        let mut clipped: Vec<(Time, Time)> = intervals
            .iter()
            .map(|(s, e)| (s.max(window_start), *e))
            .collect();
        clipped.sort_by(|a, b| a.0.total_cmp(&b.0));

        let used: Time = clipped.iter().map(|(s, e)| *e - *s).sum();
        let excess = used + air_time - budget;

        if excess.seconds() <= DUTY_CYCLE_EPSILON {
            return Ok(());
        }

        // Slide the window forward until enough old air time has dropped out of it.
        let mut cumulative = Time::ZERO;
        for (s, e) in &clipped {
            let length = *e - *s;
            if cumulative + length >= excess {
                return Err(*s + (excess - cumulative) + self.duty_cycle_window);
            }
            cumulative += length;
        }

        Err(clipped
            .last()
            .map(|(_, e)| *e + self.duty_cycle_window)
            .unwrap_or(start))
    }
}

/// Drops resolved frames that no unresolved frame overlaps.
fn prune(frames: &mut Vec<ActiveFrame>) {
    let unresolved: Vec<Frame> = frames
        .iter()
        .filter(|x| !x.resolved)
        .map(|x| x.frame.clone())
        .collect();

    frames.retain(|x| !x.resolved || unresolved.iter().any(|u| u.overlaps(&x.frame)));
}
