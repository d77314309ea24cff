use crate::{
    AcqError, Channel, ConditionsInfo, ConfigError, Driver, PulseWidthType, StepContext,
    ThresholdDirection, ThresholdMode, TriggerState, UnitModel,
};
use log::{info, warn};

/// Hysteresis applied to level triggers built by [`TriggerSpec::level`].
pub const DEFAULT_HYSTERESIS: u16 = 256 * 10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelProperties {
    pub threshold_upper: i16,
    pub threshold_upper_hysteresis: u16,
    pub threshold_lower: i16,
    pub threshold_lower_hysteresis: u16,
    pub channel: Channel,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Condition {
    pub source: Channel,
    pub state: TriggerState,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Direction {
    pub source: Channel,
    pub direction: ThresholdDirection,
    pub mode: ThresholdMode,
}

/// Precondition on how long a signal stays in a state before the main
/// trigger is evaluated. Without conditions it is switched off.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PulseWidthQualifier {
    pub conditions: Vec<Condition>,
    pub directions: Vec<Direction>,
    pub lower: u32,
    pub upper: u32,
    pub kind: PulseWidthType,
}

impl PulseWidthQualifier {
    pub fn is_enabled(&self) -> bool {
        !self.conditions.is_empty()
    }
}

/// Everything needed to program the trigger in one go.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriggerSpec {
    pub properties: Vec<ChannelProperties>,
    /// An empty list installs no trigger at all.
    pub conditions: Vec<Condition>,
    pub directions: Vec<Direction>,
    pub pulse_width: PulseWidthQualifier,
    /// Delay in sample periods between trigger and first sample.
    pub delay: u32,
    /// Fire anyway after this many microseconds; 0 waits forever.
    pub auto_trigger_us: u64,
}

fn conditions_info(conditions: &[Condition]) -> ConditionsInfo {
    if conditions.is_empty() {
        ConditionsInfo::Clear
    } else {
        ConditionsInfo::ClearAndAdd
    }
}

impl TriggerSpec {
    /// Single-channel level trigger at `mv` on `channel`.
    ///
    /// A threshold beyond the channel's range is pulled in to half the range.
    pub fn level(
        unit: &UnitModel,
        channel: Channel,
        mv: i32,
        direction: ThresholdDirection,
    ) -> Result<Self, ConfigError> {
        if channel != Channel::External && !unit.is_enabled(channel) {
            return Err(ConfigError::ChannelDisabled(channel));
        }
        let range_mv = unit
            .range_mv(channel)
            .ok_or(ConfigError::NoSuchChannel(channel))? as i32;

        let mut mv = mv;
        if mv.abs() > range_mv {
            warn!(
                "Trigger level {mv} mV is outside the ±{range_mv} mV range of channel {channel}, using {} mV",
                range_mv / 2
            );
            mv = range_mv / 2;
        }
        let threshold = unit.mv_to_adc(f64::from(mv), channel);

        Ok(Self {
            properties: vec![ChannelProperties {
                threshold_upper: threshold,
                threshold_upper_hysteresis: DEFAULT_HYSTERESIS,
                threshold_lower: threshold,
                threshold_lower_hysteresis: DEFAULT_HYSTERESIS,
                channel,
            }],
            conditions: vec![Condition {
                source: channel,
                state: TriggerState::True,
            }],
            directions: vec![Direction {
                source: channel,
                direction,
                mode: ThresholdMode::Level,
            }],
            ..Self::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.conditions.is_empty()
    }

    /// Threshold in ADC codes of the first property, if any.
    pub fn threshold(&self) -> Option<(Channel, i16)> {
        self.properties
            .first()
            .map(|p| (p.channel, p.threshold_upper))
    }
}

/// Programs `spec` into the device, stopping at the first failing step.
pub fn apply_trigger<D: Driver>(driver: &mut D, spec: &TriggerSpec) -> Result<(), AcqError> {
    driver
        .set_trigger_channel_properties(&spec.properties)
        .at("set trigger channel properties")?;
    driver
        .set_trigger_channel_conditions(&spec.conditions, conditions_info(&spec.conditions))
        .at("set trigger channel conditions")?;
    driver
        .set_trigger_channel_directions(&spec.directions)
        .at("set trigger channel directions")?;
    driver
        .set_auto_trigger_us(spec.auto_trigger_us)
        .at("set auto trigger")?;
    driver.set_trigger_delay(spec.delay).at("set trigger delay")?;

    let pwq = &spec.pulse_width;
    driver
        .set_pulse_width_qualifier_conditions(&pwq.conditions, conditions_info(&pwq.conditions))
        .at("set pulse width qualifier conditions")?;
    driver
        .set_pulse_width_qualifier_directions(&pwq.directions)
        .at("set pulse width qualifier directions")?;
    driver
        .set_pulse_width_qualifier_properties(pwq.lower, pwq.upper, pwq.kind)
        .at("set pulse width qualifier properties")?;

    if let Some((channel, threshold)) = spec.threshold() {
        info!("Trigger armed on channel {channel} at {threshold} ADC counts");
    }
    Ok(())
}

/// Installs the "no trigger" configuration.
pub fn disable_trigger<D: Driver>(driver: &mut D) -> Result<(), AcqError> {
    driver
        .set_simple_trigger(false, Channel::External, 0, ThresholdDirection::Rising, 0, 0)
        .at("set simple trigger")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PicoStatus, Resolution, SimConfig, SimulatedScope};

    fn unit() -> UnitModel {
        UnitModel::new("5444D", "GO123/456", 4, Resolution::Bits8, 32512)
    }

    #[test]
    fn applies_steps_in_order() {
        let mut sim = SimulatedScope::new(SimConfig::default());
        let spec = TriggerSpec::level(&unit(), Channel::A, 500, ThresholdDirection::Rising).unwrap();
        apply_trigger(&mut sim, &spec).unwrap();

        assert_eq!(
            sim.calls(),
            [
                "set_trigger_channel_properties",
                "set_trigger_channel_conditions",
                "set_trigger_channel_directions",
                "set_auto_trigger_us",
                "set_trigger_delay",
                "set_pulse_width_qualifier_conditions",
                "set_pulse_width_qualifier_directions",
                "set_pulse_width_qualifier_properties",
            ]
        );
        assert_eq!(sim.trigger().conditions_info, Some(ConditionsInfo::ClearAndAdd));
        assert_eq!(sim.trigger().pwq_info, Some(ConditionsInfo::Clear));
        assert_eq!(sim.trigger().conditions, spec.conditions);
    }

    #[test]
    fn empty_conditions_install_no_trigger() {
        let mut sim = SimulatedScope::new(SimConfig::default());
        apply_trigger(&mut sim, &TriggerSpec::default()).unwrap();
        assert_eq!(sim.trigger().conditions_info, Some(ConditionsInfo::Clear));
        assert!(sim.trigger().conditions.is_empty());
        assert!(!TriggerSpec::default().is_enabled());
    }

    #[test]
    fn pulse_width_with_conditions_is_installed() {
        let mut sim = SimulatedScope::new(SimConfig::default());
        let mut spec = TriggerSpec::level(&unit(), Channel::B, 200, ThresholdDirection::Falling).unwrap();
        spec.pulse_width = PulseWidthQualifier {
            conditions: vec![Condition {
                source: Channel::B,
                state: TriggerState::True,
            }],
            directions: vec![Direction {
                source: Channel::B,
                direction: ThresholdDirection::Falling,
                mode: ThresholdMode::Level,
            }],
            lower: 100,
            upper: 0,
            kind: PulseWidthType::GreaterThan,
        };
        apply_trigger(&mut sim, &spec).unwrap();
        assert_eq!(sim.trigger().pwq_info, Some(ConditionsInfo::ClearAndAdd));
        assert_eq!(sim.trigger().pwq_kind, PulseWidthType::GreaterThan);
        assert!(spec.pulse_width.is_enabled());
    }

    #[test]
    fn first_failure_names_the_step_and_stops() {
        let mut sim = SimulatedScope::new(SimConfig::default());
        sim.fail_next("set_auto_trigger_us", PicoStatus::InvalidParameter);
        let spec = TriggerSpec::level(&unit(), Channel::A, 500, ThresholdDirection::Rising).unwrap();

        match apply_trigger(&mut sim, &spec) {
            Err(AcqError::Driver { step, status }) => {
                assert_eq!(step, "set auto trigger");
                assert_eq!(status, PicoStatus::InvalidParameter);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sim.calls().last().map(String::as_str), Some("set_auto_trigger_us"));
        assert!(!sim.calls().iter().any(|c| c == "set_trigger_delay"));
    }

    #[test]
    fn reapplying_is_harmless() {
        let mut sim = SimulatedScope::new(SimConfig::default());
        let spec = TriggerSpec::level(&unit(), Channel::A, 500, ThresholdDirection::Rising).unwrap();
        apply_trigger(&mut sim, &spec).unwrap();
        let first = sim.trigger().clone();
        apply_trigger(&mut sim, &spec).unwrap();
        assert_eq!(sim.trigger(), &first);
    }

    #[test]
    fn level_threshold_is_clamped_to_half_range() {
        let mut unit = unit();
        let mut updates = std::collections::BTreeMap::new();
        updates.insert(
            Channel::A,
            crate::ChannelSettings {
                range: 4,
                ..crate::ChannelSettings::default()
            },
        );
        unit.update_channels(&updates).unwrap();

        let spec = TriggerSpec::level(&unit, Channel::A, 500, ThresholdDirection::Rising).unwrap();
        // 100 mV on the ±200 mV range
        assert_eq!(spec.threshold(), Some((Channel::A, 16256)));
    }

    #[test]
    fn level_on_disabled_channel_is_rejected() {
        let mut unit = unit();
        unit.set_enabled(Channel::C, false);
        assert_eq!(
            TriggerSpec::level(&unit, Channel::C, 100, ThresholdDirection::Rising),
            Err(ConfigError::ChannelDisabled(Channel::C))
        );
        assert!(TriggerSpec::level(&unit, Channel::External, 500, ThresholdDirection::Rising).is_ok());
    }

    #[test]
    fn disable_uses_simple_trigger() {
        let mut sim = SimulatedScope::new(SimConfig::default());
        disable_trigger(&mut sim).unwrap();
        assert_eq!(sim.calls(), ["set_simple_trigger"]);
        assert!(sim.trigger().conditions.is_empty());
    }
}
