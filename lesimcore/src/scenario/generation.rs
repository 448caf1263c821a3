use rand::{Rng, SeedableRng, seq::IndexedRandom};
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};

use crate::{
    location::Location,
    radio::{
        ConfigurationError, DEFAULT_CHANNELS, MAX_SPREADING_FACTOR, MIN_SPREADING_FACTOR,
        RadioSettings,
    },
    scenario::{Device, Scenario, ScenarioIdentity, ScenarioSettings},
    units::*,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartSpreadingFactor {
    Fixed(u8),
    /// Uniform over 7..=12.
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScenarioGenerator {
    /// Devices spread uniformly over a square cell with the gateway in the middle.
    UniformCell {
        device_count: usize,
        cell_size: Length,

        /// Device altitude is uniform between these.
        min_altitude: Length,
        max_altitude: Length,

        /// Chance a device is placed indoors.
        indoor_probability: f64,

        start_sf: StartSpreadingFactor,
        /// Pick each device's channel from the default channels,
        /// otherwise every device uses `radio.frequency`.
        random_channel: bool,
        radio: RadioSettings,

        settings: ScenarioSettings,
    },
}

impl ScenarioGenerator {
    /// A 10 km cell with devices between 10 and 60 m up, all starting at SF7.
    pub fn uniform_cell(device_count: usize) -> ScenarioGenerator {
        ScenarioGenerator::UniformCell {
            device_count,
            cell_size: 10.0 * KM,
            min_altitude: 10.0 * METRES,
            max_altitude: 60.0 * METRES,
            indoor_probability: 0.0,
            start_sf: StartSpreadingFactor::Fixed(7),
            random_channel: true,
            radio: RadioSettings::default(),
            settings: ScenarioSettings::default(),
        }
    }

    pub fn generate_from_seed(&self, seed: u64) -> Result<Scenario, ConfigurationError> {
        let rng = ChaCha12Rng::seed_from_u64(seed);
        let mut output = self.generate(rng)?;

        output.identity = ScenarioIdentity::Generated {
            generator: self.clone(),
            seed,
        };
        output.name = format!("{}-{seed}", output.name);
        Ok(output)
    }

    /// Checks the ranges devices are drawn from.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| Err(ConfigurationError::Scenario(reason.to_owned()));

        match self {
            ScenarioGenerator::UniformCell {
                cell_size,
                min_altitude,
                max_altitude,
                indoor_probability,
                start_sf,
                ..
            } => {
                if !cell_size.is_finite() || *cell_size < Length::ZERO {
                    return invalid("cell size must not be negative");
                }
                if !min_altitude.is_finite()
                    || !max_altitude.is_finite()
                    || *min_altitude < Length::ZERO
                    || min_altitude > max_altitude
                {
                    return invalid("altitude range must be ordered and not negative");
                }
                if !(0.0..=1.0).contains(indoor_probability) {
                    return invalid("indoor probability must be between 0 and 1");
                }
                if let StartSpreadingFactor::Fixed(sf) = start_sf {
                    if !(MIN_SPREADING_FACTOR..=MAX_SPREADING_FACTOR).contains(sf) {
                        return Err(ConfigurationError::SpreadingFactor(*sf));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn generate(&self, mut rng: ChaCha12Rng) -> Result<Scenario, ConfigurationError> {
        self.validate()?;

        match self.clone() {
            ScenarioGenerator::UniformCell {
                device_count,
                cell_size,
                min_altitude,
                max_altitude,
                indoor_probability,
                start_sf,
                random_channel,
                radio,
                settings,
            } => {
                let middle = cell_size / 2.0;

                let devices = (0..device_count)
                    .map(|_| {
                        let location = Location::new(
                            cell_size.map(|x| rng.random_range(0.0..=x)),
                            cell_size.map(|x| rng.random_range(0.0..=x)),
                            Length::from_metres(
                                rng.random_range(min_altitude.metres()..=max_altitude.metres()),
                            ),
                            rng.random_bool(indoor_probability),
                        );

                        let mut radio = radio.clone();
                        if random_channel {
                            radio.frequency =
                                *DEFAULT_CHANNELS.choose(&mut rng).unwrap_or(&radio.frequency);
                        }
                        radio.spreading_factor = match start_sf {
                            StartSpreadingFactor::Fixed(sf) => sf,
                            StartSpreadingFactor::Random => {
                                rng.random_range(MIN_SPREADING_FACTOR..=MAX_SPREADING_FACTOR)
                            }
                        };

                        Device { location, radio }
                    })
                    .collect();

                Ok(Scenario {
                    identity: ScenarioIdentity::Custom,
                    name: format!("uniform-cell-{device_count}"),
                    gateway: Location::outdoor(middle, middle),
                    devices,
                    settings,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_stay_inside_the_cell() {
        let scenario = ScenarioGenerator::uniform_cell(200)
            .generate_from_seed(3)
            .unwrap();

        assert_eq!(scenario.devices.len(), 200);
        assert_eq!(scenario.gateway, Location::outdoor(5.0 * KM, 5.0 * KM));
        assert_eq!(scenario.validate(), Ok(()));

        for device in &scenario.devices {
            let location = device.location;
            assert!(location.x >= 0.0 * KM && location.x <= 10.0 * KM);
            assert!(location.y >= 0.0 * KM && location.y <= 10.0 * KM);
            assert!(location.altitude >= 10.0 * METRES && location.altitude <= 60.0 * METRES);
            assert!(!location.indoor);
            assert_eq!(device.radio.spreading_factor, 7);
            assert!(DEFAULT_CHANNELS.contains(&device.radio.frequency));
        }
    }

    #[test]
    fn identity_regenerates_the_same_scenario() {
        let generator = ScenarioGenerator::UniformCell {
            device_count: 20,
            cell_size: 2.0 * KM,
            min_altitude: 0.0 * METRES,
            max_altitude: 0.0 * METRES,
            indoor_probability: 0.5,
            start_sf: StartSpreadingFactor::Random,
            random_channel: false,
            radio: RadioSettings::default(),
            settings: ScenarioSettings::default(),
        };

        let scenario = generator.generate_from_seed(11).unwrap();
        let again = scenario.identity.create().unwrap();

        assert_eq!(scenario.devices, again.devices);
        assert_eq!(scenario.name, "uniform-cell-20-11");
        assert!(
            scenario
                .devices
                .iter()
                .all(|x| x.radio.frequency == DEFAULT_CHANNELS[0])
        );

        let other = generator.generate_from_seed(12).unwrap();
        assert_ne!(scenario.devices, other.devices);
    }

    #[test]
    fn bad_ranges_are_rejected_before_drawing() {
        let with = |change: fn(&mut ScenarioGenerator)| {
            let mut generator = ScenarioGenerator::uniform_cell(10);
            change(&mut generator);
            generator.generate_from_seed(0)
        };

        let bad: [fn(&mut ScenarioGenerator); 5] = [
            |x| {
                let ScenarioGenerator::UniformCell { cell_size, .. } = x;
                *cell_size = -1.0 * KM;
            },
            |x| {
                let ScenarioGenerator::UniformCell { min_altitude, .. } = x;
                *min_altitude = 100.0 * METRES;
            },
            |x| {
                let ScenarioGenerator::UniformCell { indoor_probability, .. } = x;
                *indoor_probability = f64::NAN;
            },
            |x| {
                let ScenarioGenerator::UniformCell { indoor_probability, .. } = x;
                *indoor_probability = 1.5;
            },
            |x| {
                let ScenarioGenerator::UniformCell { start_sf, .. } = x;
                *start_sf = StartSpreadingFactor::Fixed(6);
            },
        ];

        for change in bad {
            assert!(with(change).is_err());
        }

        let custom = ScenarioIdentity::Custom.create();
        assert!(matches!(custom, Err(ConfigurationError::Scenario(_))));
    }
}
