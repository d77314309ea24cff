use crate::{AcqError, Driver, PicoStatus, UnitModel, DUAL_SCOPE, QUAD_SCOPE};
use log::{info, warn};

/// Upper bound on state transitions in one negotiation.
pub const MAX_TRANSITIONS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    SupplyConnected,
    SupplyNotConnected,
    Usb3OnNonUsb3Port,
    Undervoltage,
    Ok,
}

impl PowerState {
    /// `None` for statuses that are neither OK nor a power condition.
    pub fn from_status(status: PicoStatus) -> Option<Self> {
        match status {
            PicoStatus::Ok => Some(Self::Ok),
            PicoStatus::PowerSupplyConnected => Some(Self::SupplyConnected),
            PicoStatus::PowerSupplyNotConnected => Some(Self::SupplyNotConnected),
            PicoStatus::Usb3DeviceNonUsb3Port => Some(Self::Usb3OnNonUsb3Port),
            PicoStatus::PowerSupplyUndervoltage => Some(Self::Undervoltage),
            _ => None,
        }
    }
}

/// Decisions only the operator can make during negotiation.
pub trait PowerPrompt {
    /// Called once at the start of every negotiation.
    fn begin(&mut self) {}
    /// The external supply is missing: run from USB power alone?
    fn accept_usb_power(&mut self) -> bool;
    /// A USB 3.0 device sits on a slower port: carry on anyway?
    fn accept_non_usb3_port(&mut self) -> bool;
    /// USB cannot supply enough voltage. `true` once the supply has been
    /// plugged in, `false` to give up.
    fn retry_after_undervoltage(&mut self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Negotiation {
    /// The device settled; the interrupted call may be retried.
    Proceed,
    /// The operator declined; the in-flight operation must stop.
    Abort,
}

/// Fixed answers, e.g. from the configuration file.
#[derive(Clone, Debug)]
pub struct PowerPolicy {
    pub accept_usb_power: bool,
    pub accept_non_usb3_port: bool,
    /// How many times to re-check after an undervoltage report, per
    /// negotiation.
    pub undervoltage_retries: u32,
    retries_used: u32,
}

impl PowerPolicy {
    pub fn new(accept_usb_power: bool, accept_non_usb3_port: bool, undervoltage_retries: u32) -> Self {
        Self {
            accept_usb_power,
            accept_non_usb3_port,
            undervoltage_retries,
            retries_used: 0,
        }
    }

    pub fn accept_all() -> Self {
        Self::new(true, true, 3)
    }

    pub fn refuse_all() -> Self {
        Self::new(false, false, 0)
    }
}

impl PowerPrompt for PowerPolicy {
    fn begin(&mut self) {
        self.retries_used = 0;
    }

    fn accept_usb_power(&mut self) -> bool {
        self.accept_usb_power
    }

    fn accept_non_usb3_port(&mut self) -> bool {
        self.accept_non_usb3_port
    }

    fn retry_after_undervoltage(&mut self) -> bool {
        if self.retries_used < self.undervoltage_retries {
            self.retries_used += 1;
            true
        } else {
            false
        }
    }
}

/// Walks the power-source state machine starting from `status` until the
/// device reports OK or the operator gives up.
pub fn negotiate<D: Driver>(
    driver: &mut D,
    unit: &mut UnitModel,
    status: PicoStatus,
    prompt: &mut dyn PowerPrompt,
) -> Result<Negotiation, AcqError> {
    let mut state = PowerState::from_status(status).ok_or(AcqError::Driver {
        step: "power source",
        status,
    })?;
    prompt.begin();

    for _ in 0..MAX_TRANSITIONS {
        let reply = match state {
            PowerState::Ok => return Ok(Negotiation::Proceed),
            PowerState::SupplyNotConnected => {
                warn!("5 V power supply not connected");
                if !prompt.accept_usb_power() {
                    warn!("Please use the +5 V power supply to power this unit");
                    return Ok(Negotiation::Abort);
                }
                info!("Powering the unit via USB");
                let reply = driver.change_power_source(PicoStatus::PowerSupplyNotConnected);
                if reply.is_ok() && unit.channel_count == QUAD_SCOPE {
                    info!("Channels C and D are unavailable on USB power");
                    unit.disable_channels_from(DUAL_SCOPE);
                }
                reply
            }
            PowerState::SupplyConnected => {
                info!("Using +5 V power supply voltage");
                driver.change_power_source(PicoStatus::PowerSupplyConnected)
            }
            PowerState::Usb3OnNonUsb3Port => {
                warn!("USB 3.0 device on non-USB 3.0 port");
                if !prompt.accept_non_usb3_port() {
                    warn!("Please use a USB 3.0 port");
                    return Ok(Negotiation::Abort);
                }
                info!("Switching to USB power from a non-USB 3.0 port");
                driver.change_power_source(PicoStatus::Usb3DeviceNonUsb3Port)
            }
            PowerState::Undervoltage => {
                warn!("USB not supplying required voltage, plug in the +5 V power supply");
                if !prompt.retry_after_undervoltage() {
                    return Ok(Negotiation::Abort);
                }
                match driver.change_power_source(PicoStatus::PowerSupplyConnected) {
                    // supply still not detected
                    PicoStatus::PowerSupplyRequestInvalid => continue,
                    reply => reply,
                }
            }
        };

        state = PowerState::from_status(reply).ok_or(AcqError::Driver {
            step: "change power source",
            status: reply,
        })?;
    }

    Err(AcqError::PowerNegotiationExhausted(MAX_TRANSITIONS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel, Resolution, SimConfig, SimulatedScope};

    fn quad() -> UnitModel {
        UnitModel::new("5444D", "GO123/456", 4, Resolution::Bits8, 32512)
    }

    fn sim_with_replies(replies: &[PicoStatus]) -> SimulatedScope {
        SimulatedScope::new(SimConfig {
            power_replies: replies.iter().copied().collect(),
            ..SimConfig::default()
        })
    }

    #[test]
    fn usb_power_accepted_disables_upper_channels() {
        let mut sim = sim_with_replies(&[PicoStatus::Ok]);
        let mut unit = quad();
        let outcome = negotiate(
            &mut sim,
            &mut unit,
            PicoStatus::PowerSupplyNotConnected,
            &mut PowerPolicy::accept_all(),
        )
        .unwrap();

        assert_eq!(outcome, Negotiation::Proceed);
        assert_eq!(sim.power_requests(), [PicoStatus::PowerSupplyNotConnected]);
        assert_eq!(unit.enabled_channels(), vec![Channel::A, Channel::B]);
    }

    #[test]
    fn dual_unit_keeps_its_channels() {
        let mut sim = sim_with_replies(&[PicoStatus::Ok]);
        let mut unit = UnitModel::new("5242D", "X", 2, Resolution::Bits8, 32512);
        negotiate(
            &mut sim,
            &mut unit,
            PicoStatus::PowerSupplyNotConnected,
            &mut PowerPolicy::accept_all(),
        )
        .unwrap();
        assert_eq!(unit.enabled_channels(), vec![Channel::A, Channel::B]);
    }

    #[test]
    fn usb_power_refused_aborts_without_driver_call() {
        let mut sim = sim_with_replies(&[]);
        let mut unit = quad();
        let outcome = negotiate(
            &mut sim,
            &mut unit,
            PicoStatus::PowerSupplyNotConnected,
            &mut PowerPolicy::refuse_all(),
        )
        .unwrap();
        assert_eq!(outcome, Negotiation::Abort);
        assert!(sim.power_requests().is_empty());
        assert_eq!(unit.enabled_channels().len(), 4);
    }

    #[test]
    fn undervoltage_after_accepting_usb_power() {
        let mut sim = sim_with_replies(&[
            PicoStatus::PowerSupplyUndervoltage,
            PicoStatus::PowerSupplyRequestInvalid,
            PicoStatus::Ok,
        ]);
        let mut unit = quad();
        let outcome = negotiate(
            &mut sim,
            &mut unit,
            PicoStatus::PowerSupplyNotConnected,
            &mut PowerPolicy::accept_all(),
        )
        .unwrap();

        assert_eq!(outcome, Negotiation::Proceed);
        assert_eq!(
            sim.power_requests(),
            [
                PicoStatus::PowerSupplyNotConnected,
                PicoStatus::PowerSupplyConnected,
                PicoStatus::PowerSupplyConnected,
            ]
        );
    }

    #[test]
    fn undervoltage_cancelled() {
        let mut sim = sim_with_replies(&[PicoStatus::PowerSupplyRequestInvalid]);
        let mut unit = quad();
        let mut policy = PowerPolicy::new(true, true, 1);
        let outcome = negotiate(
            &mut sim,
            &mut unit,
            PicoStatus::PowerSupplyUndervoltage,
            &mut policy,
        )
        .unwrap();
        assert_eq!(outcome, Negotiation::Abort);
        assert_eq!(sim.power_requests().len(), 1);
    }

    #[test]
    fn undervoltage_budget_is_per_negotiation() {
        let mut sim = sim_with_replies(&[PicoStatus::Ok, PicoStatus::Ok]);
        let mut unit = quad();
        let mut policy = PowerPolicy::new(true, true, 1);
        for _ in 0..2 {
            let outcome = negotiate(
                &mut sim,
                &mut unit,
                PicoStatus::PowerSupplyUndervoltage,
                &mut policy,
            )
            .unwrap();
            assert_eq!(outcome, Negotiation::Proceed);
        }
        assert_eq!(sim.power_requests().len(), 2);
    }

    #[test]
    fn non_usb3_port_accept_then_undervoltage() {
        let mut sim = sim_with_replies(&[PicoStatus::PowerSupplyUndervoltage, PicoStatus::Ok]);
        let mut unit = quad();
        let outcome = negotiate(
            &mut sim,
            &mut unit,
            PicoStatus::Usb3DeviceNonUsb3Port,
            &mut PowerPolicy::accept_all(),
        )
        .unwrap();
        assert_eq!(outcome, Negotiation::Proceed);
        assert_eq!(
            sim.power_requests(),
            [PicoStatus::Usb3DeviceNonUsb3Port, PicoStatus::PowerSupplyConnected]
        );
        assert_eq!(unit.enabled_channels().len(), 4);
    }

    #[test]
    fn non_usb3_port_refused() {
        let mut sim = sim_with_replies(&[]);
        let mut unit = quad();
        let outcome = negotiate(
            &mut sim,
            &mut unit,
            PicoStatus::Usb3DeviceNonUsb3Port,
            &mut PowerPolicy::refuse_all(),
        )
        .unwrap();
        assert_eq!(outcome, Negotiation::Abort);
    }

    #[test]
    fn supply_connected_is_acknowledged() {
        let mut sim = sim_with_replies(&[PicoStatus::Ok]);
        let mut unit = quad();
        let outcome = negotiate(
            &mut sim,
            &mut unit,
            PicoStatus::PowerSupplyConnected,
            &mut PowerPolicy::refuse_all(),
        )
        .unwrap();
        assert_eq!(outcome, Negotiation::Proceed);
        assert_eq!(sim.power_requests(), [PicoStatus::PowerSupplyConnected]);
    }

    #[test]
    fn endless_undervoltage_is_bounded() {
        let replies = vec![PicoStatus::PowerSupplyUndervoltage; 32];
        let mut sim = sim_with_replies(&replies);
        let mut unit = quad();
        let mut policy = PowerPolicy::new(true, true, u32::MAX);
        let err = negotiate(
            &mut sim,
            &mut unit,
            PicoStatus::PowerSupplyUndervoltage,
            &mut policy,
        )
        .unwrap_err();
        assert!(matches!(err, AcqError::PowerNegotiationExhausted(MAX_TRANSITIONS)));
        assert_eq!(sim.power_requests().len(), MAX_TRANSITIONS);
    }

    #[test]
    fn unrelated_status_is_an_error() {
        let mut sim = sim_with_replies(&[]);
        let mut unit = quad();
        let err = negotiate(
            &mut sim,
            &mut unit,
            PicoStatus::InvalidHandle,
            &mut PowerPolicy::accept_all(),
        )
        .unwrap_err();
        assert_eq!(err.status(), Some(PicoStatus::InvalidHandle));

        let mut sim = sim_with_replies(&[PicoStatus::NotResponding]);
        let err = negotiate(
            &mut sim,
            &mut unit,
            PicoStatus::PowerSupplyConnected,
            &mut PowerPolicy::accept_all(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AcqError::Driver {
                step: "change power source",
                status: PicoStatus::NotResponding
            }
        ));
    }

    #[test]
    fn ok_status_needs_nothing() {
        let mut sim = sim_with_replies(&[]);
        let mut unit = quad();
        assert_eq!(
            negotiate(&mut sim, &mut unit, PicoStatus::Ok, &mut PowerPolicy::refuse_all()).unwrap(),
            Negotiation::Proceed
        );
        assert!(sim.power_requests().is_empty());
    }
}
