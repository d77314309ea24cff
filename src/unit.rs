use crate::{Channel, ChannelFlags, ConfigError, Coupling, Resolution};
use std::collections::BTreeMap;

/// Full-scale input ranges in millivolts, indexed by range id.
pub const INPUT_RANGES_MV: [u32; 12] = [
    10, 20, 50, 100, 200, 500, 1000, 2000, 5000, 10000, 20000, 50000,
];

pub const DUAL_SCOPE: usize = 2;
pub const QUAD_SCOPE: usize = 4;

/// Range id of the ±5 V range, used as the power-on default.
pub const DEFAULT_RANGE: usize = 8;
/// The external trigger input always behaves like the ±5 V range.
pub const EXTERNAL_RANGE: usize = 8;

pub const FIRST_RANGE: usize = 0;
pub const LAST_RANGE: usize = 11;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelSettings {
    pub coupling: Coupling,
    pub enabled: bool,
    pub range: usize,
    pub analog_offset: f32,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            coupling: Coupling::Ac,
            enabled: true,
            range: DEFAULT_RANGE,
            analog_offset: 0.0,
        }
    }
}

/// Converts an ADC code to millivolts on the given range.
pub fn adc_to_mv(raw: i32, range: usize, max_adc_value: i16) -> f64 {
    let range_mv = INPUT_RANGES_MV.get(range).copied().unwrap_or(0);
    f64::from(raw) * f64::from(range_mv) / f64::from(max_adc_value)
}

/// Converts millivolts to the nearest ADC code on the given range.
pub fn mv_to_adc(mv: f64, range: usize, max_adc_value: i16) -> i16 {
    let range_mv = INPUT_RANGES_MV.get(range).copied().unwrap_or(1).max(1);
    let code = (mv * f64::from(max_adc_value) / f64::from(range_mv)).round();
    code.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Description of one opened digitiser.
///
/// Channel settings live here and nowhere else; every pipeline reads them
/// back from the model when it needs them.
#[derive(Clone, Debug)]
pub struct UnitModel {
    pub model: String,
    pub serial: String,
    pub channel_count: usize,
    pub first_range: usize,
    pub last_range: usize,
    pub digital_port_count: usize,
    /// Current timebase index used for block captures.
    pub timebase: u32,
    /// Show mV instead of raw ADC codes in human-readable output.
    pub scale_voltages: bool,
    channels: BTreeMap<Channel, ChannelSettings>,
    resolution: Resolution,
    max_adc_value: i16,
}

impl UnitModel {
    pub fn new(
        model: &str,
        serial: &str,
        channel_count: usize,
        resolution: Resolution,
        max_adc_value: i16,
    ) -> Self {
        let channels = Channel::ANALOG
            .iter()
            .take(channel_count)
            .map(|&ch| (ch, ChannelSettings::default()))
            .collect();
        Self {
            model: model.to_string(),
            serial: serial.to_string(),
            channel_count,
            first_range: FIRST_RANGE,
            last_range: LAST_RANGE,
            digital_port_count: 0,
            timebase: 1,
            scale_voltages: true,
            channels,
            resolution,
            max_adc_value,
        }
    }

    /// Channel count and digital port count encoded in a variant string
    /// such as `5444D` or `5444DMSO`.
    pub fn parse_variant(variant: &str) -> (usize, usize) {
        let channel_count = variant
            .chars()
            .nth(1)
            .and_then(|c| c.to_digit(10))
            .map(|d| d as usize)
            .filter(|&n| n == DUAL_SCOPE || n == QUAD_SCOPE)
            .unwrap_or(DUAL_SCOPE);
        let digital_ports = if variant.contains("MSO") { 2 } else { 0 };
        (channel_count, digital_ports)
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn max_adc_value(&self) -> i16 {
        self.max_adc_value
    }

    /// Resolution and full-scale code always change together.
    pub fn set_resolution(&mut self, resolution: Resolution, max_adc_value: i16) {
        self.resolution = resolution;
        self.max_adc_value = max_adc_value;
    }

    pub fn channels(&self) -> &BTreeMap<Channel, ChannelSettings> {
        &self.channels
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelSettings> {
        self.channels.get(&channel)
    }

    pub fn is_enabled(&self, channel: Channel) -> bool {
        self.channels.get(&channel).is_some_and(|s| s.enabled)
    }

    pub fn enabled_channels(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(&ch, _)| ch)
            .collect()
    }

    pub fn enabled_flags(&self) -> ChannelFlags {
        self.enabled_channels().into_iter().collect()
    }

    /// Range id used to scale samples (or thresholds) of `channel`.
    pub fn range_of(&self, channel: Channel) -> Option<usize> {
        match channel {
            Channel::External => Some(EXTERNAL_RANGE),
            ch => self.channels.get(&ch).map(|s| s.range),
        }
    }

    pub fn range_mv(&self, channel: Channel) -> Option<u32> {
        self.range_of(channel)
            .and_then(|r| INPUT_RANGES_MV.get(r).copied())
    }

    /// Millivolts of `raw` on the channel's selected range.
    pub fn adc_to_mv(&self, raw: i16, channel: Channel) -> f64 {
        let range = self.range_of(channel).unwrap_or(DEFAULT_RANGE);
        adc_to_mv(i32::from(raw), range, self.max_adc_value)
    }

    /// ADC code of `mv` on the channel's selected range.
    pub fn mv_to_adc(&self, mv: f64, channel: Channel) -> i16 {
        let range = self.range_of(channel).unwrap_or(DEFAULT_RANGE);
        mv_to_adc(mv, range, self.max_adc_value)
    }

    /// Checks a full channel map against this unit and a resolution.
    pub fn validate(
        &self,
        channels: &BTreeMap<Channel, ChannelSettings>,
        resolution: Resolution,
    ) -> Result<(), ConfigError> {
        for (&channel, settings) in channels {
            if channel == Channel::External || channel.index() >= self.channel_count {
                return Err(ConfigError::NoSuchChannel(channel));
            }
            if settings.range < self.first_range || settings.range > self.last_range {
                return Err(ConfigError::RangeOutOfBounds {
                    channel,
                    range: settings.range,
                    first: self.first_range,
                    last: self.last_range,
                });
            }
        }
        let enabled = channels.values().filter(|s| s.enabled).count();
        if enabled == 0 {
            return Err(ConfigError::NoChannelEnabled);
        }
        if let Some(max) = resolution.max_enabled_channels() {
            if enabled > max {
                return Err(ConfigError::TooManyChannels {
                    resolution,
                    enabled,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Replaces the given channels' settings after validating the result.
    pub fn update_channels(
        &mut self,
        updates: &BTreeMap<Channel, ChannelSettings>,
    ) -> Result<(), ConfigError> {
        let mut merged = self.channels.clone();
        for (&channel, &settings) in updates {
            if !merged.contains_key(&channel) {
                return Err(ConfigError::NoSuchChannel(channel));
            }
            merged.insert(channel, settings);
        }
        self.validate(&merged, self.resolution)?;
        self.channels = merged;
        Ok(())
    }

    /// Switches off every channel past the first `keep`.
    pub fn disable_channels_from(&mut self, keep: usize) {
        for (channel, settings) in self.channels.iter_mut() {
            if channel.index() >= keep {
                settings.enabled = false;
            }
        }
    }

    pub fn set_enabled(&mut self, channel: Channel, enabled: bool) {
        if let Some(settings) = self.channels.get_mut(&channel) {
            settings.enabled = enabled;
        }
    }
}
