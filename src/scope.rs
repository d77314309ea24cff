use crate::{
    disable_trigger, negotiate, AcqError, Channel, ChannelSettings, Driver, Negotiation,
    PicoStatus, PowerPrompt, Resolution, StepContext, TimebaseInfo, UnitInfo, UnitModel,
    DUAL_SCOPE, INPUT_RANGES_MV, QUAD_SCOPE,
};
use log::{debug, info, warn};
use std::collections::BTreeMap;

/// Samples per segment used when probing a timebase outside a capture.
pub const TIMEBASE_PROBE_SAMPLES: u32 = 2000;
/// Negotiated transitions allowed while re-arming a run.
pub const MAX_ARM_RETRIES: usize = 4;

/// An opened digitiser.
///
/// Owns the driver handle and the unit model exclusively; each acquisition
/// borrows the whole scope mutably, so only one can be armed at a time.
pub struct Scope<D: Driver> {
    driver: D,
    unit: UnitModel,
    prompt: Box<dyn PowerPrompt>,
}

impl<D: Driver> Scope<D> {
    /// Finishes opening a unit whose handle is already in `driver`.
    ///
    /// `open_status` is what the open call returned; a power condition there
    /// is negotiated before anything else is configured.
    pub fn open(
        mut driver: D,
        open_status: PicoStatus,
        prompt: Box<dyn PowerPrompt>,
    ) -> Result<Self, AcqError> {
        let variant = driver.unit_info(UnitInfo::VariantInfo).at("get unit info")?;
        let serial = driver
            .unit_info(UnitInfo::BatchAndSerial)
            .at("get unit info")?;
        let (channel_count, digital_ports) = UnitModel::parse_variant(&variant);
        let resolution = driver.device_resolution().at("get device resolution")?;
        let max_adc = driver.maximum_value().at("get maximum value")?;

        let mut unit = UnitModel::new(&variant, &serial, channel_count, resolution, max_adc);
        unit.digital_port_count = digital_ports;
        let mut scope = Self {
            driver,
            unit,
            prompt,
        };

        if open_status.is_power_condition() {
            if let Negotiation::Abort = scope.negotiate(open_status)? {
                if let Err(status) = scope.driver.close() {
                    warn!("Failed to close unit after power abort: {status}");
                }
                return Err(AcqError::Driver {
                    step: "open unit",
                    status: open_status,
                });
            }
        } else if !open_status.is_ok() {
            return Err(open_status).at("open unit");
        }

        for port in 0..scope.unit.digital_port_count {
            scope
                .driver
                .set_digital_port(port, false)
                .at("set digital port")?;
        }
        if !scope.has_external_supply() {
            scope.unit.disable_channels_from(DUAL_SCOPE);
        }
        scope.apply_channels()?;
        disable_trigger(&mut scope.driver)?;

        info!(
            "Opened {} [{}] with {} channels at {}",
            scope.unit.model,
            scope.unit.serial,
            scope.unit.channel_count,
            scope.unit.resolution()
        );
        Ok(scope)
    }

    pub fn close(mut self) -> Result<(), AcqError> {
        info!("Closing {} [{}]", self.unit.model, self.unit.serial);
        self.driver.close().at("close unit")
    }

    pub fn unit(&self) -> &UnitModel {
        &self.unit
    }

    pub fn unit_mut(&mut self) -> &mut UnitModel {
        &mut self.unit
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub(crate) fn parts(&mut self) -> (&mut D, &UnitModel) {
        (&mut self.driver, &self.unit)
    }

    /// False when a quad unit runs from USB power alone.
    pub fn has_external_supply(&mut self) -> bool {
        self.unit.channel_count != QUAD_SCOPE
            || self.driver.current_power_source() != PicoStatus::PowerSupplyNotConnected
    }

    /// Enabled channels that can actually deliver data right now.
    pub fn usable_channels(&mut self) -> Vec<Channel> {
        let supplied = self.has_external_supply();
        self.unit
            .enabled_channels()
            .into_iter()
            .filter(|ch| supplied || ch.index() < DUAL_SCOPE)
            .collect()
    }

    /// Pushes the model's channel settings to the device.
    pub fn apply_channels(&mut self) -> Result<(), AcqError> {
        let supplied = self.has_external_supply();
        for (&channel, settings) in self.unit.channels() {
            if !supplied && channel.index() >= DUAL_SCOPE {
                debug!("Skipping channel {channel}, no external supply");
                continue;
            }
            self.driver
                .set_channel(
                    channel,
                    settings.enabled,
                    settings.coupling,
                    settings.range,
                    settings.analog_offset,
                )
                .at("set channel")?;
        }
        Ok(())
    }

    /// Validates and stores new channel settings, then applies them.
    pub fn set_channels(
        &mut self,
        updates: &BTreeMap<Channel, ChannelSettings>,
    ) -> Result<(), AcqError> {
        self.unit.update_channels(updates)?;
        self.apply_channels()
    }

    pub fn set_resolution(&mut self, resolution: Resolution) -> Result<(), AcqError> {
        self.unit.validate(self.unit.channels(), resolution)?;
        self.driver
            .set_device_resolution(resolution)
            .at("set device resolution")?;
        let max_adc = self.driver.maximum_value().at("get maximum value")?;
        self.unit.set_resolution(resolution, max_adc);
        info!("Resolution set to {resolution}");
        Ok(())
    }

    /// Picks the first valid timebase at or above `requested` and stores it
    /// in the unit model.
    pub fn set_timebase(&mut self, requested: u32) -> Result<TimebaseInfo, AcqError> {
        let (shortest, interval_s) = self
            .driver
            .minimum_timebase(self.unit.enabled_flags(), self.unit.resolution())
            .at("get minimum timebase")?;
        info!(
            "Shortest timebase index available is {shortest} ({:.1} ns)",
            interval_s * 1e9
        );
        let timebase = self.negotiate_timebase(requested, TIMEBASE_PROBE_SAMPLES, 0)?;
        self.unit.timebase = timebase.timebase;
        info!(
            "Timebase {} gives a {} ns sample interval",
            timebase.timebase, timebase.interval_ns
        );
        Ok(timebase)
    }

    /// Walks upward from `start` while the device answers invalid timebase.
    /// Any other rejection is fatal.
    pub fn negotiate_timebase(
        &mut self,
        start: u32,
        n_samples: u32,
        segment: u32,
    ) -> Result<TimebaseInfo, AcqError> {
        let mut timebase = start;
        loop {
            match self.driver.timebase(timebase, n_samples, segment) {
                Ok(info) => return Ok(info),
                Err(PicoStatus::InvalidTimebase) => {
                    debug!("Timebase {timebase} rejected, trying the next one");
                    timebase = timebase
                        .checked_add(1)
                        .ok_or(PicoStatus::InvalidTimebase)
                        .at("get timebase")?;
                }
                Err(status) => return Err(status).at("get timebase"),
            }
        }
    }

    /// Runs the power-source state machine on `status`.
    pub fn negotiate(&mut self, status: PicoStatus) -> Result<Negotiation, AcqError> {
        negotiate(&mut self.driver, &mut self.unit, status, self.prompt.as_mut())
    }

    /// Calls `op`, negotiating and retrying once per power condition it
    /// reports. `Ok(None)` means the operator aborted the negotiation.
    pub fn retry_on_power<T>(
        &mut self,
        step: &'static str,
        mut op: impl FnMut(&mut D) -> Result<T, PicoStatus>,
    ) -> Result<Option<T>, AcqError> {
        let mut retries = 0;
        loop {
            match op(&mut self.driver) {
                Ok(value) => return Ok(Some(value)),
                Err(status) if status.is_power_condition() && retries < MAX_ARM_RETRIES => {
                    retries += 1;
                    warn!("{step} reported {status}, negotiating power source");
                    if let Negotiation::Abort = self.negotiate(status)? {
                        return Ok(None);
                    }
                }
                Err(status) => return Err(status).at(step),
            }
        }
    }

    /// Current channel ranges and resolution, one line each.
    pub fn display_settings(&mut self) -> Result<Vec<String>, AcqError> {
        let mut lines = Vec::new();
        for (channel, settings) in self.unit.channels() {
            let range = INPUT_RANGES_MV.get(settings.range).copied().unwrap_or(0);
            let line = if !settings.enabled {
                format!("Channel {channel} Voltage Range = Off")
            } else if range < 1000 {
                format!("Channel {channel} Voltage Range = {range}mV")
            } else {
                format!("Channel {channel} Voltage Range = {}V", range / 1000)
            };
            lines.push(line);
        }
        let resolution = self
            .driver
            .device_resolution()
            .at("get device resolution")?;
        lines.push(format!("Device Resolution: {resolution}"));
        let scale = if self.unit.scale_voltages {
            "mV"
        } else {
            "ADC counts"
        };
        lines.push(format!("Readings will be scaled in {scale}"));

        for line in &lines {
            info!("{line}");
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PowerPolicy, SimConfig, SimulatedScope};

    fn open_sim(config: SimConfig) -> Scope<SimulatedScope> {
        let status = config.power_source;
        Scope::open(
            SimulatedScope::new(config),
            status,
            Box::new(PowerPolicy::accept_all()),
        )
        .unwrap()
    }

    #[test]
    fn open_reads_the_unit_and_installs_no_trigger() {
        let scope = open_sim(SimConfig::default());
        assert_eq!(scope.unit().model, "5444D");
        assert_eq!(scope.unit().channel_count, 4);
        assert_eq!(scope.unit().max_adc_value(), 32512);
        assert_eq!(scope.unit().timebase, 1);
        assert_eq!(scope.unit().enabled_channels().len(), 4);

        let sim = scope.driver();
        assert_eq!(sim.channel(Channel::D).map(|c| c.range), Some(8));
        assert!(sim.trigger().conditions.is_empty());
        assert_eq!(sim.calls().last().map(String::as_str), Some("set_simple_trigger"));
    }

    #[test]
    fn mso_variant_switches_digital_ports_off() {
        let scope = open_sim(SimConfig {
            variant: "5444DMSO".to_string(),
            ..SimConfig::default()
        });
        assert_eq!(scope.unit().digital_port_count, 2);
        let ports = scope
            .driver()
            .calls()
            .iter()
            .filter(|c| *c == "set_digital_port")
            .count();
        assert_eq!(ports, 2);
    }

    #[test]
    fn open_on_usb_power_negotiates_and_skips_upper_channels() {
        let scope = open_sim(SimConfig {
            power_source: PicoStatus::PowerSupplyNotConnected,
            ..SimConfig::default()
        });
        assert_eq!(
            scope.driver().power_requests(),
            [PicoStatus::PowerSupplyNotConnected]
        );
        assert_eq!(scope.unit().enabled_channels(), vec![Channel::A, Channel::B]);
        assert!(scope.driver().channel(Channel::C).is_none());
    }

    #[test]
    fn refused_power_fails_the_open() {
        let config = SimConfig {
            power_source: PicoStatus::PowerSupplyNotConnected,
            ..SimConfig::default()
        };
        let result = Scope::open(
            SimulatedScope::new(config),
            PicoStatus::PowerSupplyNotConnected,
            Box::new(PowerPolicy::refuse_all()),
        );
        assert!(matches!(
            result,
            Err(AcqError::Driver {
                step: "open unit",
                ..
            })
        ));
    }

    #[test]
    fn failed_close_after_power_abort_keeps_the_open_error() {
        let mut sim = SimulatedScope::new(SimConfig::default());
        sim.fail_next("close", PicoStatus::NotResponding);
        let result = Scope::open(
            sim,
            PicoStatus::PowerSupplyNotConnected,
            Box::new(PowerPolicy::refuse_all()),
        );
        assert!(matches!(
            result,
            Err(AcqError::Driver {
                step: "open unit",
                status: PicoStatus::PowerSupplyNotConnected
            })
        ));
    }

    #[test]
    fn resolution_refreshes_max_adc() {
        let mut scope = open_sim(SimConfig::default());
        scope.set_resolution(Resolution::Bits12).unwrap();
        assert_eq!(scope.unit().resolution(), Resolution::Bits12);
        assert_eq!(scope.unit().max_adc_value(), 32767);
    }

    #[test]
    fn resolution_with_too_many_channels_makes_no_device_call() {
        let mut scope = open_sim(SimConfig::default());
        scope.driver_mut().clear_calls();
        let err = scope.set_resolution(Resolution::Bits15).unwrap_err();
        assert!(matches!(err, AcqError::Config(_)));
        assert!(scope.driver().calls().is_empty());
        assert_eq!(scope.unit().resolution(), Resolution::Bits8);
    }

    #[test]
    fn channel_updates_are_applied() {
        let mut scope = open_sim(SimConfig::default());
        let mut updates = BTreeMap::new();
        updates.insert(
            Channel::B,
            ChannelSettings {
                range: 3,
                coupling: crate::Coupling::Dc,
                ..ChannelSettings::default()
            },
        );
        scope.set_channels(&updates).unwrap();
        let b = scope.driver().channel(Channel::B).unwrap();
        assert_eq!((b.range, b.coupling), (3, crate::Coupling::Dc));
        assert_eq!(scope.unit().range_mv(Channel::B), Some(100));
    }

    #[test]
    fn invalid_range_is_rejected_before_the_device() {
        let mut scope = open_sim(SimConfig::default());
        scope.driver_mut().clear_calls();
        let mut updates = BTreeMap::new();
        updates.insert(
            Channel::A,
            ChannelSettings {
                range: 42,
                ..ChannelSettings::default()
            },
        );
        assert!(scope.set_channels(&updates).is_err());
        assert!(scope.driver().calls().is_empty());
    }

    #[test]
    fn timebase_walks_upward() {
        let mut scope = open_sim(SimConfig {
            min_timebase: 5,
            ..SimConfig::default()
        });
        let info = scope.set_timebase(2).unwrap();
        assert_eq!(info.timebase, 5);
        assert_eq!(scope.unit().timebase, 5);
        assert_eq!(info.interval_ns, 24);
        let probes = scope
            .driver()
            .calls()
            .iter()
            .filter(|c| *c == "timebase")
            .count();
        assert_eq!(probes, 4);
    }

    #[test]
    fn channel_count_error_from_timebase_is_fatal() {
        let mut scope = open_sim(SimConfig::default());
        scope
            .driver_mut()
            .fail_next("timebase", PicoStatus::InvalidNumberChannelsForResolution);
        match scope.set_timebase(1) {
            Err(AcqError::Driver { step, status }) => {
                assert_eq!(step, "get timebase");
                assert_eq!(status, PicoStatus::InvalidNumberChannelsForResolution);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(scope.unit().timebase, 1);
    }

    #[test]
    fn power_retry_reissues_the_call() {
        let mut scope = open_sim(SimConfig::default());
        let mut attempts = 0;
        let out = scope
            .retry_on_power("run block", |_| {
                attempts += 1;
                if attempts == 1 {
                    Err(PicoStatus::PowerSupplyConnected)
                } else {
                    Ok(attempts)
                }
            })
            .unwrap();
        assert_eq!(out, Some(2));
        assert_eq!(
            scope.driver().power_requests(),
            [PicoStatus::PowerSupplyConnected]
        );
    }

    #[test]
    fn power_retry_is_bounded() {
        let mut scope = open_sim(SimConfig::default());
        let mut attempts = 0;
        let err = scope
            .retry_on_power("run streaming", |_| -> Result<(), PicoStatus> {
                attempts += 1;
                Err(PicoStatus::PowerSupplyConnected)
            })
            .unwrap_err();
        assert_eq!(attempts, MAX_ARM_RETRIES + 1);
        assert_eq!(err.status(), Some(PicoStatus::PowerSupplyConnected));
    }

    #[test]
    fn settings_display() {
        let mut scope = open_sim(SimConfig::default());
        scope.unit_mut().set_enabled(Channel::D, false);
        let mut updates = BTreeMap::new();
        updates.insert(
            Channel::B,
            ChannelSettings {
                range: 4,
                ..ChannelSettings::default()
            },
        );
        scope.set_channels(&updates).unwrap();
        let lines = scope.display_settings().unwrap();
        assert_eq!(lines[0], "Channel A Voltage Range = 5V");
        assert_eq!(lines[1], "Channel B Voltage Range = 200mV");
        assert_eq!(lines[3], "Channel D Voltage Range = Off");
        assert_eq!(lines[4], "Device Resolution: 8 bits");
    }
}
