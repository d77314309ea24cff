use crate::{ChannelProperties, Condition, Direction, PicoStatus};
use serde::Deserialize;
use std::fmt;

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Deserialize)]
pub enum Channel {
    A = 0,
    B = 1,
    C = 2,
    D = 3,
    #[serde(alias = "EXT", alias = "ext")]
    External = 4,
}

impl Channel {
    pub const ANALOG: [Channel; 4] = [Channel::A, Channel::B, Channel::C, Channel::D];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::A),
            1 => Some(Self::B),
            2 => Some(Self::C),
            3 => Some(Self::D),
            4 => Some(Self::External),
            _ => None,
        }
    }

    pub fn letter(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::External => "EXT",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coupling {
    #[default]
    Ac = 0,
    Dc = 1,
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum Resolution {
    #[default]
    Bits8 = 0,
    Bits12 = 1,
    Bits14 = 2,
    Bits15 = 3,
    Bits16 = 4,
}

impl Resolution {
    pub fn bits(self) -> u8 {
        match self {
            Self::Bits8 => 8,
            Self::Bits12 => 12,
            Self::Bits14 => 14,
            Self::Bits15 => 15,
            Self::Bits16 => 16,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(Self::Bits8),
            12 => Some(Self::Bits12),
            14 => Some(Self::Bits14),
            15 => Some(Self::Bits15),
            16 => Some(Self::Bits16),
            _ => None,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Bits8),
            1 => Some(Self::Bits12),
            2 => Some(Self::Bits14),
            3 => Some(Self::Bits15),
            4 => Some(Self::Bits16),
            _ => None,
        }
    }

    /// Upper bound on simultaneously enabled channels, if the resolution imposes one.
    pub fn max_enabled_channels(self) -> Option<usize> {
        match self {
            Self::Bits15 => Some(2),
            Self::Bits16 => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bits", self.bits())
    }
}

/// Bit set of enabled channels as the driver expects it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ChannelFlags(pub u32);

impl ChannelFlags {
    pub fn insert(&mut self, channel: Channel) {
        self.0 |= 1 << channel.index();
    }

    pub fn contains(self, channel: Channel) -> bool {
        self.0 & (1 << channel.index()) != 0
    }
}

impl FromIterator<Channel> for ChannelFlags {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        let mut flags = ChannelFlags::default();
        for channel in iter {
            flags.insert(channel);
        }
        flags
    }
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnits {
    Fs = 0,
    Ps = 1,
    #[default]
    Ns = 2,
    Us = 3,
    Ms = 4,
    S = 5,
}

impl TimeUnits {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Fs,
            1 => Self::Ps,
            3 => Self::Us,
            4 => Self::Ms,
            5 => Self::S,
            _ => Self::Ns,
        }
    }
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatioMode {
    #[default]
    None = 0,
    Aggregate = 1,
    Decimate = 2,
    Average = 4,
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TriggerState {
    #[default]
    DontCare = 0,
    True = 1,
    False = 2,
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdDirection {
    Above = 0,
    Below = 1,
    #[default]
    Rising = 2,
    Falling = 3,
    RisingOrFalling = 4,
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ThresholdMode {
    #[default]
    Level = 0,
    Window = 1,
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PulseWidthType {
    #[default]
    None = 0,
    LessThan = 1,
    GreaterThan = 2,
    InRange = 3,
    OutOfRange = 4,
}

/// How a condition list is installed.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConditionsInfo {
    /// Drop whatever is installed and install nothing.
    Clear = 1,
    /// Drop whatever is installed and install the given list.
    ClearAndAdd = 3,
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnitInfo {
    DriverVersion = 0,
    UsbVersion = 1,
    HardwareVersion = 2,
    VariantInfo = 3,
    BatchAndSerial = 4,
    CalDate = 5,
    KernelVersion = 6,
    DigitalHardwareVersion = 7,
    AnalogueHardwareVersion = 8,
    Firmware1 = 9,
    Firmware2 = 10,
}

impl UnitInfo {
    pub const ALL: [UnitInfo; 11] = [
        UnitInfo::DriverVersion,
        UnitInfo::UsbVersion,
        UnitInfo::HardwareVersion,
        UnitInfo::VariantInfo,
        UnitInfo::BatchAndSerial,
        UnitInfo::CalDate,
        UnitInfo::KernelVersion,
        UnitInfo::DigitalHardwareVersion,
        UnitInfo::AnalogueHardwareVersion,
        UnitInfo::Firmware1,
        UnitInfo::Firmware2,
    ];

    pub fn description(self) -> &'static str {
        match self {
            Self::DriverVersion => "Driver Version",
            Self::UsbVersion => "USB Version",
            Self::HardwareVersion => "Hardware Version",
            Self::VariantInfo => "Variant Info",
            Self::BatchAndSerial => "Serial",
            Self::CalDate => "Cal Date",
            Self::KernelVersion => "Kernel Version",
            Self::DigitalHardwareVersion => "Digital HW Version",
            Self::AnalogueHardwareVersion => "Analogue HW Version",
            Self::Firmware1 => "Firmware 1",
            Self::Firmware2 => "Firmware 2",
        }
    }
}

/// Application memory handed to the driver for one (channel, segment).
///
/// The driver keeps the raw pointers until the binding is cleared, so the
/// memory behind them must stay allocated and unmoved until then.
#[derive(Clone, Copy, Debug)]
pub struct BufferBinding {
    pub max: *mut i16,
    /// Aggregated minimum values; may be null when only `max` is wanted.
    pub min: *mut i16,
    pub len: usize,
    pub mode: RatioMode,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamingRequest {
    pub sample_interval: u32,
    pub time_units: TimeUnits,
    pub pre_trigger: u32,
    pub post_trigger: u32,
    pub auto_stop: bool,
    pub downsample_ratio: u32,
    pub ratio_mode: RatioMode,
    /// Capacity of the overview buffer, in samples per channel.
    pub overview_len: u32,
}

/// What one latest-values poll reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamingReady {
    pub n_samples: u32,
    pub start_index: u32,
    /// Bit per channel that went over range.
    pub overflow: i16,
    /// Trigger position relative to the samples of this poll.
    pub trigger_at: u32,
    pub triggered: bool,
    pub auto_stop: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimebaseInfo {
    pub timebase: u32,
    pub interval_ns: i32,
    pub max_samples: i32,
}

/// Per-segment trigger timing record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriggerInfo {
    pub status: PicoStatus,
    pub segment_index: u32,
    pub trigger_index: u32,
    pub trigger_time: i64,
    pub time_units: TimeUnits,
    pub timestamp_counter: u64,
}

impl Default for TriggerInfo {
    fn default() -> Self {
        Self {
            status: PicoStatus::Ok,
            segment_index: 0,
            trigger_index: 0,
            trigger_time: 0,
            time_units: TimeUnits::Ns,
            timestamp_counter: 0,
        }
    }
}

/// Operations the acquisition layer needs from the device driver.
///
/// Every call maps to one driver entry point; a non-OK status comes back
/// as `Err`. Implementations own the device handle.
pub trait Driver {
    fn unit_info(&mut self, info: UnitInfo) -> Result<String, PicoStatus>;

    /// Returns the power condition the device is currently in (`Ok` when
    /// nothing needs negotiating).
    fn current_power_source(&mut self) -> PicoStatus;
    /// Tells the driver which power state to accept; the reply may itself
    /// be a power condition.
    fn change_power_source(&mut self, state: PicoStatus) -> PicoStatus;

    fn device_resolution(&mut self) -> Result<Resolution, PicoStatus>;
    fn set_device_resolution(&mut self, resolution: Resolution) -> Result<(), PicoStatus>;
    fn maximum_value(&mut self) -> Result<i16, PicoStatus>;

    fn set_channel(
        &mut self,
        channel: Channel,
        enabled: bool,
        coupling: Coupling,
        range: usize,
        analog_offset: f32,
    ) -> Result<(), PicoStatus>;
    fn set_digital_port(&mut self, port: usize, enabled: bool) -> Result<(), PicoStatus>;

    /// Shortest timebase and its interval in seconds for the channel set.
    fn minimum_timebase(
        &mut self,
        channels: ChannelFlags,
        resolution: Resolution,
    ) -> Result<(u32, f64), PicoStatus>;
    fn timebase(
        &mut self,
        timebase: u32,
        n_samples: u32,
        segment: u32,
    ) -> Result<TimebaseInfo, PicoStatus>;

    fn set_trigger_channel_properties(
        &mut self,
        properties: &[ChannelProperties],
    ) -> Result<(), PicoStatus>;
    fn set_trigger_channel_conditions(
        &mut self,
        conditions: &[Condition],
        info: ConditionsInfo,
    ) -> Result<(), PicoStatus>;
    fn set_trigger_channel_directions(&mut self, directions: &[Direction])
        -> Result<(), PicoStatus>;
    fn set_auto_trigger_us(&mut self, micros: u64) -> Result<(), PicoStatus>;
    fn set_trigger_delay(&mut self, delay: u32) -> Result<(), PicoStatus>;
    fn set_pulse_width_qualifier_conditions(
        &mut self,
        conditions: &[Condition],
        info: ConditionsInfo,
    ) -> Result<(), PicoStatus>;
    fn set_pulse_width_qualifier_directions(
        &mut self,
        directions: &[Direction],
    ) -> Result<(), PicoStatus>;
    fn set_pulse_width_qualifier_properties(
        &mut self,
        lower: u32,
        upper: u32,
        kind: PulseWidthType,
    ) -> Result<(), PicoStatus>;
    fn set_simple_trigger(
        &mut self,
        enabled: bool,
        source: Channel,
        threshold: i16,
        direction: ThresholdDirection,
        delay: u32,
        auto_trigger_ms: i16,
    ) -> Result<(), PicoStatus>;

    /// Binds (`Some`) or clears (`None`) the buffers of one channel/segment.
    ///
    /// # Safety
    ///
    /// The pointers in `buffers` must stay valid for `len` samples until the
    /// same (channel, segment) is cleared or rebound; the driver writes into
    /// them during later calls.
    unsafe fn set_data_buffers(
        &mut self,
        channel: Channel,
        segment: u32,
        buffers: Option<BufferBinding>,
    ) -> Result<(), PicoStatus>;

    fn clear_data_buffers(&mut self, channel: Channel, segment: u32) -> Result<(), PicoStatus> {
        // SAFETY: clearing hands no memory to the driver.
        unsafe { self.set_data_buffers(channel, segment, None) }
    }

    /// Arms streaming; returns the sample interval the device settled on.
    fn run_streaming(&mut self, request: &StreamingRequest) -> Result<u32, PicoStatus>;
    /// `Ok(None)` when the device had nothing new since the last poll.
    fn streaming_latest_values(&mut self) -> Result<Option<StreamingReady>, PicoStatus>;

    fn max_segments(&mut self) -> Result<u32, PicoStatus>;
    /// Returns the number of samples available per segment.
    fn memory_segments(&mut self, n_segments: u32) -> Result<i32, PicoStatus>;
    fn set_no_of_captures(&mut self, n_captures: u32) -> Result<(), PicoStatus>;
    /// Arms a block run; returns the time in ms the device will be busy.
    fn run_block(
        &mut self,
        pre_trigger: u32,
        post_trigger: u32,
        timebase: u32,
        segment: u32,
    ) -> Result<i32, PicoStatus>;
    fn is_ready(&mut self) -> Result<bool, PicoStatus>;
    fn no_of_captures(&mut self) -> Result<u32, PicoStatus>;
    /// Copies segments `from..=to` into their bound buffers; returns the
    /// number of samples per segment actually retrieved.
    fn values_bulk(
        &mut self,
        n_samples: u32,
        from: u32,
        to: u32,
        downsample_ratio: u32,
        mode: RatioMode,
        overflow: &mut [i16],
    ) -> Result<u32, PicoStatus>;
    fn trigger_info_bulk(
        &mut self,
        info: &mut [TriggerInfo],
        from: u32,
        to: u32,
    ) -> Result<(), PicoStatus>;

    fn stop(&mut self) -> Result<(), PicoStatus>;
    fn close(&mut self) -> Result<(), PicoStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_flags_collect() {
        let flags: ChannelFlags = [Channel::A, Channel::C].into_iter().collect();
        assert_eq!(flags.0, 0b101);
        assert!(flags.contains(Channel::C));
        assert!(!flags.contains(Channel::B));
    }

    #[test]
    fn resolution_channel_limits() {
        assert_eq!(Resolution::Bits8.max_enabled_channels(), None);
        assert_eq!(Resolution::Bits15.max_enabled_channels(), Some(2));
        assert_eq!(Resolution::Bits16.max_enabled_channels(), Some(1));
        assert_eq!(Resolution::from_bits(14), Some(Resolution::Bits14));
        assert_eq!(Resolution::from_bits(10), None);
    }
}
