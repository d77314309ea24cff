use crate::{
    Channel, ChannelSettings, ConfigError, Coupling, PowerPolicy, RapidBlockSettings, RatioMode,
    Resolution, StreamingSettings, ThresholdDirection, TimeUnits, TriggerSpec, UnitModel,
    DEFAULT_RANGE,
};
use confique::Config;
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub device: DeviceSettings,
    #[config(nested)]
    pub streaming: StreamingConf,
    #[config(nested)]
    pub rapid_block: RapidBlockConf,
    #[config(nested)]
    pub power: PowerSettings,
    #[config(nested)]
    pub output: OutputSettings,
}

#[derive(Config, Debug, Clone)]
pub struct DeviceSettings {
    /// Open a specific unit by its batch/serial string.
    #[config(env = "PICO_DAQ_SERIAL")]
    pub serial: Option<String>,
    #[config(default = 8)]
    pub resolution_bits: u8,
    #[config(default = [])]
    pub channels: Vec<ChannelEntry>,
    #[config(default = true)]
    pub scale_voltages: bool,
    #[config(default = 1)]
    pub timebase: u32,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ChannelEntry {
    pub channel: Channel,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub coupling: Coupling,
    #[serde(default = "range_default")]
    pub range: usize,
    #[serde(default)]
    pub offset: f32,
}

fn enabled_default() -> bool {
    true
}

fn range_default() -> usize {
    DEFAULT_RANGE
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TriggerSettings {
    pub channel: Channel,
    pub threshold_mv: i32,
    #[serde(default)]
    pub direction: ThresholdDirection,
}

#[derive(Config, Debug, Clone)]
pub struct StreamingConf {
    #[config(default = 1)]
    pub sample_interval: u32,
    pub time_units: Option<TimeUnits>,
    #[config(default = 0)]
    pub pre_trigger: u32,
    #[config(default = 1000000)]
    pub post_trigger: u32,
    #[config(default = true)]
    pub auto_stop: bool,
    #[config(default = 1)]
    pub downsample_ratio: u32,
    pub ratio_mode: Option<RatioMode>,
    #[config(default = 50000)]
    pub overview_len: u32,
    #[config(default = 1)]
    pub poll_interval_ms: u64,
    /// Level trigger; absent means free-running.
    pub trigger: Option<TriggerSettings>,
}

#[derive(Config, Debug, Clone)]
pub struct RapidBlockConf {
    #[config(default = 10)]
    pub waveforms: u32,
    #[config(default = 2000)]
    pub samples: u32,
    #[config(default = 500)]
    pub pre_trigger: u32,
    #[config(default = 1)]
    pub downsample_ratio: u32,
    pub ratio_mode: Option<RatioMode>,
    #[config(default = 10)]
    pub poll_interval_ms: u64,
    pub trigger: Option<TriggerSettings>,
}

#[derive(Config, Debug, Clone)]
pub struct PowerSettings {
    #[config(default = true)]
    pub accept_usb_power: bool,
    #[config(default = true)]
    pub accept_non_usb3_port: bool,
    #[config(default = 0)]
    pub undervoltage_retries: u32,
}

#[derive(Config, Debug, Clone)]
pub struct OutputSettings {
    #[config(env = "PICO_DAQ_OUTPUT_DIR", default = "data")]
    pub output_dir: String,
    #[config(default = "pico_daq.log")]
    pub log_file: String,
    #[config(default = true)]
    pub stream_log: bool,
    #[config(default = true)]
    pub binary: bool,
    #[config(default = false)]
    pub hdf5: bool,
    #[config(default = true)]
    pub tui: bool,
}

impl DeviceSettings {
    pub fn resolution(&self) -> Result<Resolution, ConfigError> {
        Resolution::from_bits(self.resolution_bits)
            .ok_or(ConfigError::UnknownResolution(self.resolution_bits))
    }

    /// Channel map to hand to `Scope::set_channels`. Empty when the file
    /// lists no channels, keeping the power-on defaults.
    pub fn channel_map(&self) -> Result<BTreeMap<Channel, ChannelSettings>, ConfigError> {
        let mut map = BTreeMap::new();
        for entry in &self.channels {
            if entry.channel == Channel::External {
                return Err(ConfigError::NoSuchChannel(entry.channel));
            }
            map.insert(
                entry.channel,
                ChannelSettings {
                    coupling: entry.coupling,
                    enabled: entry.enabled,
                    range: entry.range,
                    analog_offset: entry.offset,
                },
            );
        }
        Ok(map)
    }
}

impl TriggerSettings {
    fn spec(&self, unit: &UnitModel) -> Result<TriggerSpec, ConfigError> {
        TriggerSpec::level(unit, self.channel, self.threshold_mv, self.direction)
    }
}

impl StreamingConf {
    pub fn settings(&self, unit: &UnitModel) -> Result<StreamingSettings, ConfigError> {
        let trigger = match &self.trigger {
            Some(t) => t.spec(unit)?,
            None => TriggerSpec::default(),
        };
        Ok(StreamingSettings {
            sample_interval: self.sample_interval,
            time_units: self.time_units.unwrap_or(TimeUnits::Us),
            pre_trigger: self.pre_trigger,
            post_trigger: self.post_trigger,
            auto_stop: self.auto_stop,
            downsample_ratio: self.downsample_ratio,
            ratio_mode: self.ratio_mode.unwrap_or_default(),
            overview_len: self.overview_len,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            trigger,
        })
    }
}

impl RapidBlockConf {
    pub fn settings(
        &self,
        unit: &UnitModel,
        timebase: u32,
    ) -> Result<RapidBlockSettings, ConfigError> {
        if self.pre_trigger > self.samples {
            return Err(ConfigError::TriggerSplit {
                pre: self.pre_trigger,
                post: 0,
                samples: self.samples,
            });
        }
        let trigger = match &self.trigger {
            Some(t) => t.spec(unit)?,
            None => TriggerSpec::default(),
        };
        Ok(RapidBlockSettings {
            waveforms: self.waveforms,
            samples: self.samples,
            pre_trigger: self.pre_trigger,
            post_trigger: self.samples - self.pre_trigger,
            timebase,
            downsample_ratio: self.downsample_ratio,
            ratio_mode: self.ratio_mode.unwrap_or_default(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            trigger,
        })
    }
}

impl PowerSettings {
    pub fn policy(&self) -> PowerPolicy {
        PowerPolicy::new(
            self.accept_usb_power,
            self.accept_non_usb3_port,
            self.undervoltage_retries,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, path::PathBuf};

    fn load(name: &str, body: &str) -> Conf {
        let path: PathBuf = std::env::temp_dir().join(format!(
            "pico_daq_{}_{}.toml",
            name,
            std::process::id()
        ));
        fs::write(&path, body).unwrap();
        let conf = Conf::builder().file(&path).load().unwrap();
        fs::remove_file(&path).unwrap();
        conf
    }

    fn unit() -> UnitModel {
        UnitModel::new("5444D", "X", 4, Resolution::Bits8, 32512)
    }

    #[test]
    fn empty_file_gives_defaults() {
        let conf = load("defaults", "");
        assert_eq!(conf.device.resolution().unwrap(), Resolution::Bits8);
        assert!(conf.device.channel_map().unwrap().is_empty());
        assert_eq!(conf.streaming.post_trigger, 1_000_000);
        assert_eq!(conf.rapid_block.waveforms, 10);
        assert!(conf.output.stream_log);

        let settings = conf.streaming.settings(&unit()).unwrap();
        assert_eq!(settings, StreamingSettings::default());

        let block = conf.rapid_block.settings(&unit(), 1).unwrap();
        assert_eq!(block.post_trigger, 1500);
        assert!(!block.trigger.is_enabled());
    }

    #[test]
    fn channels_and_trigger_are_read() {
        let conf = load(
            "channels",
            r#"
[device]
resolution_bits = 12
channels = [
    { channel = "A", coupling = "dc", range = 5 },
    { channel = "B", enabled = false },
]

[streaming]
trigger = { channel = "A", threshold_mv = 100 }

[rapid_block]
samples = 1000
pre_trigger = 100
trigger = { channel = "EXT", threshold_mv = 500, direction = "falling" }
"#,
        );
        assert_eq!(conf.device.resolution().unwrap(), Resolution::Bits12);
        let map = conf.device.channel_map().unwrap();
        assert_eq!(map[&Channel::A].coupling, Coupling::Dc);
        assert_eq!(map[&Channel::A].range, 5);
        assert!(!map[&Channel::B].enabled);
        assert_eq!(map[&Channel::B].range, DEFAULT_RANGE);

        let mut unit = unit();
        unit.update_channels(&map).unwrap();
        let streaming = conf.streaming.settings(&unit).unwrap();
        // 100 mV on the 500 mV range
        assert_eq!(streaming.trigger.threshold(), Some((Channel::A, 6502)));

        let block = conf.rapid_block.settings(&unit, 3).unwrap();
        assert_eq!(block.post_trigger, 900);
        assert_eq!(block.timebase, 3);
        assert_eq!(block.trigger.directions[0].direction, ThresholdDirection::Falling);
        assert_eq!(block.trigger.threshold(), Some((Channel::External, 3251)));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let conf = load(
            "invalid",
            r#"
[device]
resolution_bits = 10
channels = [{ channel = "EXT" }]

[streaming]
trigger = { channel = "B", threshold_mv = 100 }

[rapid_block]
samples = 100
pre_trigger = 200
"#,
        );
        assert_eq!(
            conf.device.resolution(),
            Err(ConfigError::UnknownResolution(10))
        );
        assert_eq!(
            conf.device.channel_map(),
            Err(ConfigError::NoSuchChannel(Channel::External))
        );

        let mut unit = unit();
        unit.set_enabled(Channel::B, false);
        assert_eq!(
            conf.streaming.settings(&unit),
            Err(ConfigError::ChannelDisabled(Channel::B))
        );
        assert!(matches!(
            conf.rapid_block.settings(&unit, 1),
            Err(ConfigError::TriggerSplit { .. })
        ));
    }

    #[test]
    fn power_policy_follows_settings() {
        let conf = load(
            "power",
            "[power]\naccept_usb_power = false\nundervoltage_retries = 2\n",
        );
        let policy = conf.power.policy();
        assert!(!policy.accept_usb_power);
        assert!(policy.accept_non_usb3_port);
        assert_eq!(policy.undervoltage_retries, 2);
    }
}
