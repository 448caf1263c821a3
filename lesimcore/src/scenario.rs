pub mod generation;

use serde::{Deserialize, Serialize};

use crate::{
    gateway::GatewaySettings,
    location::Location,
    node::NodeSettings,
    radio::{ConfigurationError, RadioConfig, RadioSettings},
    scenario::generation::ScenarioGenerator,
    snr::SnrModel,
    units::*,
};

/// Longest PHY payload at the fastest EU868 data rate.
pub const MAX_PAYLOAD_SIZE: u32 = 222;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScenarioIdentity {
    Generated {
        generator: ScenarioGenerator,
        seed: u64,
    },
    /// A custom created scenario
    Custom,
}

impl ScenarioIdentity {
    /// Regenerates the scenario. Custom scenarios can not be regenerated.
    pub fn create(&self) -> Result<Scenario, ConfigurationError> {
        match self {
            ScenarioIdentity::Custom => Err(ConfigurationError::Scenario(
                "custom scenarios can not be regenerated".to_owned(),
            )),
            ScenarioIdentity::Generated { generator, seed } => generator.generate_from_seed(*seed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub location: Location,
    /// Radio settings at start up, ADR may change them later.
    pub radio: RadioSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    // Regeneration
    pub identity: ScenarioIdentity,
    pub name: String,

    // Data values
    pub gateway: Location,
    pub devices: Vec<Device>,
    #[serde(default)]
    pub settings: ScenarioSettings,
}

/// Settings shared by the whole replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioSettings {
    /// Simulated time at which the replica stops.
    pub horizon: Time,

    /// Devices first wake uniformly within `[0, max_start_delay)`.
    /// Defaults to a tenth of the horizon.
    pub max_start_delay: Option<Time>,

    pub node: NodeSettings,
    pub gateway: GatewaySettings,
    pub snr_model: SnrModel,

    /// How much stronger a frame must be than every overlapping frame to survive.
    pub capture_margin: Dbf,
    pub duty_cycle_window: Time,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            horizon: 30.0 * 24.0 * HOURS,
            max_start_delay: None,
            node: NodeSettings::default(),
            gateway: GatewaySettings::default(),
            snr_model: SnrModel::default(),
            capture_margin: Dbf::from_db_value(6.0),
            duty_cycle_window: HOURS,
        }
    }
}

impl ScenarioSettings {
    pub fn max_start_delay(&self) -> Time {
        self.max_start_delay.unwrap_or(self.horizon / 10.0)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| Err(ConfigurationError::Scenario(reason.to_owned()));

        if !self.horizon.is_finite() || self.horizon <= Time::ZERO {
            return invalid("horizon must be positive");
        }
        let max_start_delay = self.max_start_delay();
        if !max_start_delay.is_finite() || max_start_delay < Time::ZERO {
            return invalid("start delay must not be negative");
        }
        if !(1..=MAX_PAYLOAD_SIZE).contains(&self.node.payload_size) {
            return invalid("payload size must be between 1 and 222 bytes");
        }
        if self.node.inter_arrival.mean() <= Time::ZERO {
            return invalid("inter-arrival time must be positive");
        }
        if self.node.process_time < Time::ZERO {
            return invalid("process time must not be negative");
        }
        if self.gateway.history_length == 0 {
            return invalid("gateway SNR history must hold at least one sample");
        }
        if !(1..=self.gateway.history_length).contains(&self.gateway.adr_min_samples) {
            return invalid("ADR minimum samples must fit in the gateway SNR history");
        }
        if !self.capture_margin.is_finite() {
            return invalid("capture margin must be finite");
        }
        if self.duty_cycle_window <= Time::ZERO {
            return invalid("duty cycle window must be positive");
        }

        self.node.energy.validate()
    }
}

impl Scenario {
    /// Validated radio configuration of every device, in device order.
    pub fn device_radios(&self) -> Result<Vec<RadioConfig>, ConfigurationError> {
        self.devices
            .iter()
            .map(|x| RadioConfig::try_from(x.radio.clone()))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.settings.validate()?;
        self.device_radios()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> Scenario {
        Scenario {
            identity: ScenarioIdentity::Custom,
            name: "single".to_owned(),
            gateway: Location::outdoor(0.0 * KM, 0.0 * KM),
            devices: vec![Device {
                location: Location::outdoor(1.0 * KM, 0.0 * KM),
                radio: RadioSettings::default(),
            }],
            settings: ScenarioSettings::default(),
        }
    }

    #[test]
    fn defaults_are_valid() {
        let scenario = scenario();
        assert_eq!(scenario.validate(), Ok(()));
        assert_eq!(scenario.settings.max_start_delay(), 72.0 * HOURS);
    }

    #[test]
    fn bad_device_radio_is_rejected() {
        let mut scenario = scenario();
        scenario.devices[0].radio.spreading_factor = 5;

        assert_eq!(
            scenario.validate(),
            Err(ConfigurationError::SpreadingFactor(5))
        );
    }

    #[test]
    fn bad_settings_are_rejected() {
        let mut scenario = scenario();
        scenario.settings.node.payload_size = 0;
        assert!(matches!(
            scenario.validate(),
            Err(ConfigurationError::Scenario(_))
        ));

        let mut scenario = self::scenario();
        scenario.settings.horizon = Time::ZERO;
        assert!(scenario.validate().is_err());

        let mut scenario = self::scenario();
        scenario.settings.gateway.adr_min_samples = 21;
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn missing_settings_fall_back_to_defaults() {
        let json = r#"{
            "identity": "Custom",
            "name": "minimal",
            "gateway": {"x": 0.0, "y": 0.0, "altitude": 15.0, "indoor": false},
            "devices": [],
            "settings": {"capture_margin": [3.0]}
        }"#;

        let scenario: Scenario = serde_json::from_str(json).unwrap();
        assert_eq!(scenario.settings.capture_margin, Dbf::from_db_value(3.0));
        assert_eq!(scenario.settings.horizon, ScenarioSettings::default().horizon);
    }
}
