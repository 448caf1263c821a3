//! Energy and packet delivery simulation of a single gateway LoRaWAN network.
//!
//! Many end devices ([`node::Node`]) wake up, transmit uplink frames over a shared
//! channel ([`simulation::air_interface::AirInterface`]) and listen for
//! acknowledgements from one [`gateway::Gateway`], which may steer them with ADR
//! commands. The physical layer is swappable through [`propagation::PropagationModel`],
//! so the same network can be replayed under different path loss models and compared
//! on packet loss, collisions and per device energy.
//!
//! A replica is run with [`simulation::run_simulation`].

pub mod analysis;
pub mod energy;
pub mod gateway;
pub mod location;
pub mod node;
pub mod propagation;
pub mod radio;
pub mod scenario;
pub mod sim_file;
pub mod simulation;
pub mod snr;
pub mod units;
pub mod verification;

use std::fmt::Debug;

use radio::{RadioConfig, PREAMBLE_SYMBOLS};
use units::*;

/// Duration of a single LoRa symbol.
pub fn symbol_time(spreading_factor: u8, bandwidth: Frequency) -> Time {
    2f64.powi(spreading_factor as i32) / bandwidth
}

/// Time on air of a LoRa packet.
/// Semtech SX1276/77/78/79 datasheet, section 4.1.1.7.
///
/// * `payload_size` - size of the PHY payload in bytes.
pub fn calculate_air_time(payload_size: u32, radio: &RadioConfig) -> Time {
    let sf = radio.spreading_factor() as f64;
    let symbol_time = symbol_time(radio.spreading_factor(), radio.bandwidth());

    let preamble_time = (PREAMBLE_SYMBOLS + 4.25) * symbol_time;

    let crc = if radio.crc_enabled() { 1.0 } else { 0.0 };
    let implicit_header = if radio.implicit_header() { 1.0 } else { 0.0 };
    let low_data_rate = if radio.low_data_rate_optimize() { 1.0 } else { 0.0 };

    let payload_bits = 8.0 * payload_size as f64 - 4.0 * sf + 28.0 + 16.0 * crc
        - 20.0 * implicit_header;
    let bits_per_block = 4.0 * (sf - 2.0 * low_data_rate);

    let payload_symbols = 8.0
        + ((payload_bits / bits_per_block).ceil() * radio.coding_rate() as f64).max(0.0);

    preamble_time + payload_symbols * symbol_time
}

/// Checks two values are within 0.001% of each other.
#[allow(unused)]
fn assert_close<T>(a: T, b: T)
where
    T: Into<f64> + Copy + Debug,
{
    let float_a: f64 = a.into();
    let float_b: f64 = b.into();

    if float_a == 0. || float_b == 0. {
        assert!(float_a == float_b, "{a:?} and {b:?} are not close.");
        return;
    }

    let percent_diff = (float_a - float_b).abs() / float_a.abs();

    assert!(percent_diff < 0.00001, "{a:?} and {b:?} are not close.");
}

#[cfg(test)]
mod tests {
    use crate::{
        assert_close, calculate_air_time,
        radio::{RadioConfig, RadioSettings},
        units::{Frequency, Length},
    };

    #[test]
    fn test_assert_close_pos() {
        assert_close(10.0, 10.0);
        assert_close(Length::from_metres(200.002), Length::from_metres(200.001));
    }

    #[test]
    fn test_assert_close_neg() {
        let result = std::panic::catch_unwind(|| assert_close(10.0, 11.0));
        assert!(result.is_err());
        let result = std::panic::catch_unwind(|| assert_close(0.01, 0.002));
        assert!(result.is_err());
    }

    #[test]
    fn air_time_sf7() {
        let radio = RadioConfig::try_from(RadioSettings::default()).unwrap();
        assert_close(calculate_air_time(12, &radio).milis(), 41.216);
    }

    #[test]
    fn air_time_sf12_uses_low_data_rate_optimise() {
        let radio = RadioConfig::try_from(RadioSettings {
            spreading_factor: 12,
            ..Default::default()
        })
        .unwrap();
        assert!(radio.low_data_rate_optimize());
        assert_close(calculate_air_time(12, &radio).milis(), 1155.072);
    }

    #[test]
    fn air_time_shrinks_with_bandwidth() {
        let narrow = RadioConfig::try_from(RadioSettings::default()).unwrap();
        let wide = RadioConfig::try_from(RadioSettings {
            bandwidth: Frequency::from_kHz(500.0),
            ..Default::default()
        })
        .unwrap();

        assert!(calculate_air_time(20, &wide) < calculate_air_time(20, &narrow));
    }
}
