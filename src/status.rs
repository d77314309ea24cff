/// Return code of a driver call.
///
/// Only the codes the acquisition layer reacts to get their own variant;
/// everything else is carried verbatim in `Unknown`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum PicoStatus {
    Ok,
    MaxUnitsOpened,
    MemoryFail,
    NotFound,
    OperationFailed,
    NotResponding,
    InvalidHandle,
    InvalidParameter,
    InvalidTimebase,
    InvalidVoltageRange,
    InvalidChannel,
    InvalidTriggerChannel,
    InvalidConditionChannel,
    StreamingFailed,
    BlockModeFailed,
    NullParameter,
    DataNotAvailable,
    TooManySamples,
    TooManySegments,
    NoSamplesAvailable,
    SegmentOutOfRange,
    Busy,
    InvalidInfo,
    InfoUnavailable,
    Cancelled,
    PowerSupplyConnected,
    PowerSupplyNotConnected,
    PowerSupplyRequestInvalid,
    PowerSupplyUndervoltage,
    Usb3DeviceNonUsb3Port,
    InvalidDeviceResolution,
    InvalidNumberChannelsForResolution,
    Unknown(u32),
}

impl From<u32> for PicoStatus {
    fn from(value: u32) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::MaxUnitsOpened,
            0x02 => Self::MemoryFail,
            0x03 => Self::NotFound,
            0x06 => Self::OperationFailed,
            0x07 => Self::NotResponding,
            0x0C => Self::InvalidHandle,
            0x0D => Self::InvalidParameter,
            0x0E => Self::InvalidTimebase,
            0x0F => Self::InvalidVoltageRange,
            0x10 => Self::InvalidChannel,
            0x11 => Self::InvalidTriggerChannel,
            0x12 => Self::InvalidConditionChannel,
            0x14 => Self::StreamingFailed,
            0x15 => Self::BlockModeFailed,
            0x16 => Self::NullParameter,
            0x18 => Self::DataNotAvailable,
            0x1D => Self::TooManySamples,
            0x1E => Self::TooManySegments,
            0x25 => Self::NoSamplesAvailable,
            0x26 => Self::SegmentOutOfRange,
            0x27 => Self::Busy,
            0x29 => Self::InvalidInfo,
            0x2A => Self::InfoUnavailable,
            0x3A => Self::Cancelled,
            0x119 => Self::PowerSupplyConnected,
            0x11A => Self::PowerSupplyNotConnected,
            0x11B => Self::PowerSupplyRequestInvalid,
            0x11C => Self::PowerSupplyUndervoltage,
            0x11E => Self::Usb3DeviceNonUsb3Port,
            0x120 => Self::InvalidDeviceResolution,
            0x121 => Self::InvalidNumberChannelsForResolution,
            other => Self::Unknown(other),
        }
    }
}

impl PicoStatus {
    /// Raw driver code.
    pub fn code(self) -> u32 {
        match self {
            Self::Ok => 0x00,
            Self::MaxUnitsOpened => 0x01,
            Self::MemoryFail => 0x02,
            Self::NotFound => 0x03,
            Self::OperationFailed => 0x06,
            Self::NotResponding => 0x07,
            Self::InvalidHandle => 0x0C,
            Self::InvalidParameter => 0x0D,
            Self::InvalidTimebase => 0x0E,
            Self::InvalidVoltageRange => 0x0F,
            Self::InvalidChannel => 0x10,
            Self::InvalidTriggerChannel => 0x11,
            Self::InvalidConditionChannel => 0x12,
            Self::StreamingFailed => 0x14,
            Self::BlockModeFailed => 0x15,
            Self::NullParameter => 0x16,
            Self::DataNotAvailable => 0x18,
            Self::TooManySamples => 0x1D,
            Self::TooManySegments => 0x1E,
            Self::NoSamplesAvailable => 0x25,
            Self::SegmentOutOfRange => 0x26,
            Self::Busy => 0x27,
            Self::InvalidInfo => 0x29,
            Self::InfoUnavailable => 0x2A,
            Self::Cancelled => 0x3A,
            Self::PowerSupplyConnected => 0x119,
            Self::PowerSupplyNotConnected => 0x11A,
            Self::PowerSupplyRequestInvalid => 0x11B,
            Self::PowerSupplyUndervoltage => 0x11C,
            Self::Usb3DeviceNonUsb3Port => 0x11E,
            Self::InvalidDeviceResolution => 0x120,
            Self::InvalidNumberChannelsForResolution => 0x121,
            Self::Unknown(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// One of the four conditions handled by power-source negotiation.
    pub fn is_power_condition(self) -> bool {
        matches!(
            self,
            Self::PowerSupplyConnected
                | Self::PowerSupplyNotConnected
                | Self::Usb3DeviceNonUsb3Port
                | Self::PowerSupplyUndervoltage
        )
    }

    /// Turns a raw code into `Ok(())` or `Err(status)`.
    pub fn check(code: u32) -> Result<(), PicoStatus> {
        match PicoStatus::from(code) {
            PicoStatus::Ok => Ok(()),
            status => Err(status),
        }
    }
}

impl std::fmt::Display for PicoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:08x})", self, self.code())
    }
}
