//! Verifications / tests to be run on replica results to make sure the simulator is working correctly.
//! Each public function, other than [`verify_all`], represents some property that should hold for all replica results.

use std::collections::BTreeMap;

use crate::{
    analysis::CompleteAnalysis, radio::duty_cycle_limit, simulation::data_structs::FrameRecord,
    units::*,
};

const ENERGY_TOLERANCE: f64 = 1e-6;
const DUTY_CYCLE_TOLERANCE: f64 = 1e-9;

pub fn verify_all(analysis: &CompleteAnalysis) -> bool {
    no_overlapping_transmission(analysis)
        && duty_cycle_respected(analysis)
        && energy_consistent(analysis)
        && counters_consistent(analysis)
}

/// Frames of each device, each list ordered by start time.
fn frames_by_device(analysis: &CompleteAnalysis) -> BTreeMap<usize, Vec<&FrameRecord>> {
    let mut by_device: BTreeMap<usize, Vec<&FrameRecord>> = BTreeMap::new();

    for frame in &analysis.frames {
        by_device.entry(frame.device_id).or_default().push(frame);
    }
    for frames in by_device.values_mut() {
        frames.sort_by(|x, y| x.start_time.total_cmp(&y.start_time));
    }

    by_device
}

/// No device can send more than one frame at a time.
pub fn no_overlapping_transmission(analysis: &CompleteAnalysis) -> bool {
    for frames in frames_by_device(analysis).values() {
        for pair in frames.windows(2) {
            if pair[1].start_time < pair[0].end_time() {
                tracing::warn!("Overlapping transmission");
                tracing::warn!("= First = {:#?} \n = Second = \n {:#?}", pair[0], pair[1]);
                return false;
            }
        }
    }

    true
}

/// No device uses more than its share of a channel over any window ending with one of its frames.
///
/// A frame sent on an otherwise idle channel is always allowed, even if it alone exceeds the budget.
pub fn duty_cycle_respected(analysis: &CompleteAnalysis) -> bool {
    let window = analysis.duty_cycle_window;

    for frames in frames_by_device(analysis).values() {
        for (n, frame) in frames.iter().enumerate() {
            let Some(limit) = duty_cycle_limit(frame.frequency) else {
                continue;
            };

            let window_end = frame.end_time();
            let window_start = window_end - window;
            let channel = frame.frequency.channel_key();

            let earlier: Time = frames[..n]
                .iter()
                .filter(|x| x.frequency.channel_key() == channel)
                .map(|x| {
                    let overlap = x.end_time().min(window_end) - x.start_time.max(window_start);
                    overlap.max(Time::ZERO)
                })
                .sum();

            if earlier == Time::ZERO {
                continue;
            }

            let budget = window * limit;
            let used = earlier + frame.air_time;
            if (used - budget).seconds() > DUTY_CYCLE_TOLERANCE {
                tracing::warn!(
                    device = frame.device_id,
                    frame = frame.id,
                    "Duty cycle exceeded, {} used of {}",
                    used,
                    budget
                );
                return false;
            }
        }
    }

    true
}

/// Per device energy breakdowns add up to the reported totals,
/// and so do the phase logs when they were kept.
pub fn energy_consistent(analysis: &CompleteAnalysis) -> bool {
    let close = |a: Energy, b: Energy| {
        let scale = a.joules().abs().max(b.joules().abs()).max(f64::MIN_POSITIVE);
        (a.joules() - b.joules()).abs() / scale < ENERGY_TOLERANCE
    };

    for device in &analysis.devices {
        if !close(device.energy.total(), device.total_energy) {
            tracing::warn!(
                device = device.id,
                "Energy breakdown {} does not match total {}",
                device.energy.total(),
                device.total_energy
            );
            return false;
        }

        let Some(phases) = analysis.phase_logs.get(device.id) else {
            continue;
        };
        let logged: Energy = phases.iter().map(|x| x.energy).sum();
        if !close(logged, device.total_energy) {
            tracing::warn!(
                device = device.id,
                "Phase log energy {} does not match total {}",
                logged,
                device.total_energy
            );
            return false;
        }
    }

    true
}

/// Every completed transmission belongs to a packet that was delivered, lost or retried,
/// apart from at most one packet still in flight at the horizon.
/// Each device also has at most one frame that had not finished transmitting.
pub fn counters_consistent(analysis: &CompleteAnalysis) -> bool {
    let by_device = frames_by_device(analysis);

    for device in &analysis.devices {
        let counters = &device.counters;

        let accounted =
            counters.unique_packets_sent + counters.packets_lost + counters.retransmissions;
        let in_flight = counters.transmissions.checked_sub(accounted);
        if !matches!(in_flight, Some(0 | 1)) {
            tracing::warn!(device = device.id, "Inconsistent counters {counters:#?}");
            return false;
        }

        let frames = by_device.get(&device.id).map(|x| x.len()).unwrap_or(0) as u32;
        let unfinished = frames.checked_sub(counters.transmissions);
        if !matches!(unfinished, Some(0 | 1)) {
            tracing::warn!(
                device = device.id,
                frames,
                transmissions = counters.transmissions,
                "Frames on air do not match completed transmissions"
            );
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        propagation::LogShadow,
        scenario::generation::ScenarioGenerator,
        simulation::{data_structs::FrameOutcome, run_simulation},
    };

    fn analysed(device_count: usize, seed: u64) -> CompleteAnalysis {
        let mut scenario = ScenarioGenerator::uniform_cell(device_count)
            .generate_from_seed(seed)
            .unwrap();
        scenario.settings.horizon = 24.0 * HOURS;
        scenario.settings.node.do_phase_logs = true;

        let output = run_simulation(seed, scenario, LogShadow::default().into(), false).unwrap();
        CompleteAnalysis::new(output)
    }

    fn frame(id: u32, device_id: usize, start: Time, air_time: Time) -> FrameRecord {
        FrameRecord {
            id,
            device_id,
            frequency: crate::radio::DEFAULT_CHANNELS[0],
            spreading_factor: 12,
            tx_power: 14,
            start_time: start,
            air_time,
            attempt: 0,
            rss: Dbm::from_dbm(-100.0),
            snr: Dbf::from_db_value(0.0),
            outcome: Some(FrameOutcome::Received),
        }
    }

    #[test]
    fn generated_replicas_verify() {
        for seed in 0..3 {
            let analysis = analysed(40, seed);
            assert!(!analysis.frames.is_empty());
            assert!(verify_all(&analysis), "seed {seed} failed verification");
        }
    }

    #[test]
    fn overlapping_frames_are_caught() {
        let mut analysis = analysed(2, 1);
        analysis.frames = vec![
            frame(0, 0, 10.0 * SECONDS, 2.0 * SECONDS),
            frame(1, 0, 11.0 * SECONDS, 2.0 * SECONDS),
        ];

        assert!(!no_overlapping_transmission(&analysis));

        analysis.frames[1].device_id = 1;
        assert!(no_overlapping_transmission(&analysis));
    }

    #[test]
    fn busy_channel_breaks_duty_cycle() {
        let mut analysis = analysed(1, 2);

        // 1% of an hour is 36 s.
        analysis.frames = vec![
            frame(0, 0, 0.0 * SECONDS, 20.0 * SECONDS),
            frame(1, 0, 100.0 * SECONDS, 15.0 * SECONDS),
        ];
        assert!(duty_cycle_respected(&analysis));

        analysis.frames.push(frame(2, 0, 200.0 * SECONDS, 2.0 * SECONDS));
        assert!(!duty_cycle_respected(&analysis));

        // A single long frame on an idle channel is allowed.
        analysis.frames = vec![frame(0, 0, 0.0 * SECONDS, 40.0 * SECONDS)];
        assert!(duty_cycle_respected(&analysis));
    }

    #[test]
    fn tampered_counters_are_caught() {
        let mut analysis = analysed(3, 4);
        assert!(counters_consistent(&analysis));
        assert!(energy_consistent(&analysis));

        analysis.devices[0].counters.transmissions += 5;
        assert!(!counters_consistent(&analysis));

        let mut analysis = analysed(3, 4);
        analysis.devices[1].total_energy = analysis.devices[1].total_energy * 2.0;
        assert!(!energy_consistent(&analysis));
    }
}
