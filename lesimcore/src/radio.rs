//! LoRa radio parameters for end devices and the EU868 channel plan they transmit on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::units::*;

pub const MIN_SPREADING_FACTOR: u8 = 7;
pub const MAX_SPREADING_FACTOR: u8 = 12;
pub const SPREADING_FACTORS: [u8; 6] = [12, 11, 10, 9, 8, 7];

/// Transmit power bounds in dBm.
pub const MIN_TX_POWER: i32 = 2;
pub const MAX_TX_POWER: i32 = 14;
/// ADR moves transmit power in steps of this many dB.
pub const TX_POWER_STEP: i32 = 3;

pub const PREAMBLE_SYMBOLS: f64 = 8.0;

/// Uplink channels every device may pick from at start up.
pub const DEFAULT_CHANNELS: [Frequency; 3] = [
    Frequency::from_hz(868_100_000.0),
    Frequency::from_hz(868_300_000.0),
    Frequency::from_hz(868_500_000.0),
];

/// Second receive window uses a fixed channel and data rate.
pub const RX2_FREQUENCY: Frequency = Frequency::from_hz(869_525_000.0);
pub const RX2_SPREADING_FACTOR: u8 = 9;

/// Maximum fraction of time a transmitter may occupy the given channel.
/// Returns `None` for frequencies outside the channel plan.
pub fn duty_cycle_limit(frequency: Frequency) -> Option<f64> {
    let key = frequency.channel_key();

    if DEFAULT_CHANNELS.iter().any(|x| x.channel_key() == key) {
        Some(0.01)
    } else if RX2_FREQUENCY.channel_key() == key {
        Some(0.1)
    } else {
        None
    }
}

const SUPPORTED_BANDWIDTHS_KHZ: [f64; 3] = [125.0, 250.0, 500.0];

pub fn is_supported_bandwidth(bandwidth: Frequency) -> bool {
    SUPPORTED_BANDWIDTHS_KHZ
        .iter()
        .any(|x| (bandwidth.kHz() - x).abs() < 0.5)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("spreading factor {0} is outside 7..=12")]
    SpreadingFactor(u8),
    #[error("data rate {0} is outside 0..=5")]
    DataRate(u8),
    #[error("transmit power {0} dBm is outside 2..=14 dBm")]
    TxPower(i32),
    #[error("carrier frequency {0} Hz is not part of the channel plan")]
    Frequency(f64),
    #[error("bandwidth {0} kHz is not supported")]
    Bandwidth(f64),
    #[error("coding rate 4/{0} is not supported")]
    CodingRate(u8),
    #[error("invalid energy profile: {0}")]
    EnergyProfile(String),
    #[error("invalid scenario: {0}")]
    Scenario(String),
}

/// Data rate index for a spreading factor in the EU868 plan at 125 kHz.
/// sf12 maps to dr0 through to sf7 mapping to dr5.
pub fn data_rate_for(spreading_factor: u8) -> Result<u8, ConfigurationError> {
    if !(MIN_SPREADING_FACTOR..=MAX_SPREADING_FACTOR).contains(&spreading_factor) {
        return Err(ConfigurationError::SpreadingFactor(spreading_factor));
    }

    Ok(MAX_SPREADING_FACTOR - spreading_factor)
}

/// Inverse of [`data_rate_for`].
pub fn spreading_factor_for(data_rate: u8) -> Result<u8, ConfigurationError> {
    if data_rate > MAX_SPREADING_FACTOR - MIN_SPREADING_FACTOR {
        return Err(ConfigurationError::DataRate(data_rate));
    }

    Ok(MAX_SPREADING_FACTOR - data_rate)
}

/// User facing radio settings as they appear in scenario files.
/// Converted into a validated [`RadioConfig`] before a replica starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioSettings {
    pub frequency: Frequency,
    pub spreading_factor: u8,
    pub bandwidth: Frequency,

    /// Denominator of the coding rate, 5 means 4/5.
    pub coding_rate: u8,
    pub crc_enabled: bool,
    pub low_data_rate_optimize: bool,
    pub implicit_header: bool,

    /// dBm
    pub tx_power: i32,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_CHANNELS[0],
            spreading_factor: 7,
            bandwidth: Frequency::from_kHz(125.0),
            coding_rate: 5,
            crc_enabled: true,
            low_data_rate_optimize: false,
            implicit_header: false,
            tx_power: MAX_TX_POWER,
        }
    }
}

/// Validated radio configuration of a single device.
///
/// The data rate always matches the spreading factor, and the mandated
/// low data rate optimisation and implicit header flags are re-derived every
/// time the spreading factor changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioConfig {
    frequency: Frequency,
    spreading_factor: u8,
    bandwidth: Frequency,
    coding_rate: u8,
    crc_enabled: bool,
    low_data_rate_optimize: bool,
    implicit_header: bool,
    data_rate: u8,
    tx_power: i32,

    // What the settings asked for, before anything was forced on.
    requested_ldro: bool,
    requested_implicit_header: bool,
}

impl TryFrom<RadioSettings> for RadioConfig {
    type Error = ConfigurationError;

    fn try_from(value: RadioSettings) -> Result<Self, Self::Error> {
        if duty_cycle_limit(value.frequency).is_none() {
            return Err(ConfigurationError::Frequency(value.frequency.hz()));
        }
        if !is_supported_bandwidth(value.bandwidth) {
            return Err(ConfigurationError::Bandwidth(value.bandwidth.kHz()));
        }
        if !(5..=8).contains(&value.coding_rate) {
            return Err(ConfigurationError::CodingRate(value.coding_rate));
        }
        check_tx_power(value.tx_power)?;

        let mut config = RadioConfig {
            frequency: value.frequency,
            spreading_factor: value.spreading_factor,
            bandwidth: value.bandwidth,
            coding_rate: value.coding_rate,
            crc_enabled: value.crc_enabled,
            low_data_rate_optimize: value.low_data_rate_optimize,
            implicit_header: value.implicit_header,
            data_rate: 0,
            tx_power: value.tx_power,
            requested_ldro: value.low_data_rate_optimize,
            requested_implicit_header: value.implicit_header,
        };

        config.change_spreading_factor(value.spreading_factor)?;

        Ok(config)
    }
}

fn check_tx_power(tx_power: i32) -> Result<(), ConfigurationError> {
    if !(MIN_TX_POWER..=MAX_TX_POWER).contains(&tx_power) {
        return Err(ConfigurationError::TxPower(tx_power));
    }
    Ok(())
}

impl RadioConfig {
    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn spreading_factor(&self) -> u8 {
        self.spreading_factor
    }

    pub fn bandwidth(&self) -> Frequency {
        self.bandwidth
    }

    pub fn coding_rate(&self) -> u8 {
        self.coding_rate
    }

    pub fn crc_enabled(&self) -> bool {
        self.crc_enabled
    }

    pub fn low_data_rate_optimize(&self) -> bool {
        self.low_data_rate_optimize
    }

    pub fn implicit_header(&self) -> bool {
        self.implicit_header
    }

    pub fn data_rate(&self) -> u8 {
        self.data_rate
    }

    /// dBm
    pub fn tx_power(&self) -> i32 {
        self.tx_power
    }

    pub fn tx_power_dbm(&self) -> Dbm {
        Dbm::from_dbm(self.tx_power as f64)
    }

    pub fn change_spreading_factor(&mut self, spreading_factor: u8) -> Result<(), ConfigurationError> {
        let data_rate = data_rate_for(spreading_factor)?;

        self.spreading_factor = spreading_factor;
        self.data_rate = data_rate;
        self.low_data_rate_optimize = self.requested_ldro
            || ((self.bandwidth.kHz() - 125.0).abs() < 0.5 && spreading_factor >= 11);
        // SF6 mandates an implicit header.
        self.implicit_header = self.requested_implicit_header || spreading_factor == 6;

        Ok(())
    }

    pub fn change_data_rate(&mut self, data_rate: u8) -> Result<(), ConfigurationError> {
        self.change_spreading_factor(spreading_factor_for(data_rate)?)
    }

    pub fn change_tx_power(&mut self, tx_power: i32) -> Result<(), ConfigurationError> {
        check_tx_power(tx_power)?;
        self.tx_power = tx_power;
        Ok(())
    }

    /// The configuration the device listens with in the second receive window.
    pub fn rx2(&self) -> RadioConfig {
        let mut out = self.clone();
        out.frequency = RX2_FREQUENCY;
        out.bandwidth = Frequency::from_kHz(125.0);
        out.requested_ldro = false;
        out.requested_implicit_header = false;
        out.spreading_factor = RX2_SPREADING_FACTOR;
        out.data_rate = MAX_SPREADING_FACTOR - RX2_SPREADING_FACTOR;
        out.low_data_rate_optimize = false;
        out.implicit_header = false;
        out
    }
}

/// Fixed LoRaWAN class A timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolTiming {
    /// Radio wake up from sleep, the receiver opens this much earlier than the nominal delay.
    pub radio_wakeup: Time,
    pub receive_delay1: Time,
    pub receive_delay2: Time,

    /// Number of symbols a receive window stays open waiting for a preamble.
    pub rx_window_symbols: u32,
}

impl Default for ProtocolTiming {
    fn default() -> Self {
        Self {
            radio_wakeup: Time::from_milis(3.0),
            receive_delay1: Time::from_milis(1000.0),
            receive_delay2: Time::from_milis(2000.0),
            rx_window_symbols: 8,
        }
    }
}

impl ProtocolTiming {
    /// Delay from the end of an uplink to the device opening RX1.
    pub fn rx1_open_delay(&self) -> Time {
        self.receive_delay1 - self.radio_wakeup
    }

    /// Delay from the end of an uplink to the device opening RX2.
    pub fn rx2_open_delay(&self) -> Time {
        self.receive_delay2 - self.radio_wakeup
    }

    /// How long a window listens when nothing arrives.
    pub fn rx_window_length(&self, config: &RadioConfig) -> Time {
        self.radio_wakeup
            + crate::symbol_time(config.spreading_factor(), config.bandwidth())
                * self.rx_window_symbols as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_rate_round_trips() {
        for sf in MIN_SPREADING_FACTOR..=MAX_SPREADING_FACTOR {
            let dr = data_rate_for(sf).unwrap();
            assert_eq!(spreading_factor_for(dr).unwrap(), sf);
        }
        assert_eq!(data_rate_for(12).unwrap(), 0);
        assert_eq!(data_rate_for(7).unwrap(), 5);
        assert!(data_rate_for(6).is_err());
        assert!(spreading_factor_for(6).is_err());
    }

    #[test]
    fn config_keeps_data_rate_consistent() {
        let mut config = RadioConfig::try_from(RadioSettings::default()).unwrap();

        for sf in SPREADING_FACTORS {
            config.change_spreading_factor(sf).unwrap();
            assert_eq!(
                spreading_factor_for(config.data_rate()).unwrap(),
                config.spreading_factor()
            );
        }

        for dr in 0..=5 {
            config.change_data_rate(dr).unwrap();
            assert_eq!(data_rate_for(config.spreading_factor()).unwrap(), dr);
        }
    }

    #[test]
    fn low_data_rate_optimise_forced_at_slow_rates() {
        let mut config = RadioConfig::try_from(RadioSettings::default()).unwrap();
        assert!(!config.low_data_rate_optimize());

        config.change_spreading_factor(11).unwrap();
        assert!(config.low_data_rate_optimize());

        config.change_spreading_factor(8).unwrap();
        assert!(!config.low_data_rate_optimize());

        let wide = RadioConfig::try_from(RadioSettings {
            bandwidth: Frequency::from_kHz(250.0),
            spreading_factor: 12,
            ..Default::default()
        })
        .unwrap();
        assert!(!wide.low_data_rate_optimize());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let bad_sf = RadioSettings {
            spreading_factor: 13,
            ..Default::default()
        };
        assert_eq!(
            RadioConfig::try_from(bad_sf),
            Err(ConfigurationError::SpreadingFactor(13))
        );

        let bad_tp = RadioSettings {
            tx_power: 20,
            ..Default::default()
        };
        assert_eq!(
            RadioConfig::try_from(bad_tp),
            Err(ConfigurationError::TxPower(20))
        );

        let bad_freq = RadioSettings {
            frequency: Frequency::from_MHz(915.0),
            ..Default::default()
        };
        assert!(matches!(
            RadioConfig::try_from(bad_freq),
            Err(ConfigurationError::Frequency(_))
        ));

        let mut config = RadioConfig::try_from(RadioSettings::default()).unwrap();
        assert_eq!(config.change_tx_power(1), Err(ConfigurationError::TxPower(1)));
        assert_eq!(config.tx_power(), MAX_TX_POWER);
    }

    #[test]
    fn rx2_uses_fixed_channel() {
        let config = RadioConfig::try_from(RadioSettings::default()).unwrap();
        let rx2 = config.rx2();
        assert_eq!(rx2.frequency(), RX2_FREQUENCY);
        assert_eq!(rx2.spreading_factor(), RX2_SPREADING_FACTOR);
        assert_eq!(rx2.data_rate(), 3);
    }

    #[test]
    fn duty_cycle_by_channel() {
        assert_eq!(duty_cycle_limit(DEFAULT_CHANNELS[1]), Some(0.01));
        assert_eq!(duty_cycle_limit(RX2_FREQUENCY), Some(0.1));
        assert_eq!(duty_cycle_limit(Frequency::from_MHz(433.0)), None);
    }
}
