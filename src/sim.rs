//! In-process digitiser used by the tests and by `--simulate`.
//!
//! It honours the same buffer contract as the real driver: samples are
//! written through the pointers handed over in `set_data_buffers`, so a
//! binding that outlives its memory is just as fatal here.

use crate::{
    BufferBinding, Channel, ChannelFlags, ChannelProperties, Condition, ConditionsInfo, Coupling,
    Direction, Driver, PicoStatus, PulseWidthType, RatioMode, Resolution, StreamingReady,
    StreamingRequest, ThresholdDirection, TimeUnits, TimebaseInfo, TriggerInfo, UnitInfo,
    DUAL_SCOPE, LAST_RANGE,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Samples of on-device memory per channel.
const DEVICE_MEMORY: i32 = 128 * 1024 * 1024;
/// Status flag set on the trigger info of a segment whose counter restarted.
pub const TIME_STAMP_RESET: u32 = 0x0100_0000;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub variant: String,
    pub serial: String,
    pub resolution: Resolution,
    /// What `current_power_source` reports.
    pub power_source: PicoStatus,
    /// Replies to successive `change_power_source` calls; OK once drained.
    pub power_replies: VecDeque<PicoStatus>,
    /// Samples delivered per streaming poll.
    pub chunk_len: u32,
    /// Every other poll comes back empty.
    pub idle_polls: bool,
    /// Absolute streaming sample index at which the trigger fires.
    pub streaming_trigger_at: Option<u64>,
    pub max_segments: u32,
    /// Smallest timebase index the device accepts.
    pub min_timebase: u32,
    /// `is_ready` turns true on this call; `None` never completes.
    pub ready_after_polls: Option<u32>,
    /// Captures finished when a block run is stopped early.
    pub completed_on_stop: u32,
    /// Segments whose trigger info carries a non-OK status.
    pub bad_timestamp_segments: Vec<u32>,
    /// Timestamp counter ticks between consecutive segment triggers.
    pub timestamp_stride: u64,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            variant: "5444D".to_string(),
            serial: "SIM00/001".to_string(),
            resolution: Resolution::Bits8,
            power_source: PicoStatus::Ok,
            power_replies: VecDeque::new(),
            chunk_len: 10_000,
            idle_polls: false,
            streaming_trigger_at: None,
            max_segments: 1000,
            min_timebase: 0,
            ready_after_polls: Some(1),
            completed_on_stop: 0,
            bad_timestamp_segments: Vec::new(),
            timestamp_stride: 1000,
            seed: 0x5eed,
        }
    }
}

/// Trigger state as last programmed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimTrigger {
    pub properties: Vec<ChannelProperties>,
    pub conditions: Vec<Condition>,
    pub conditions_info: Option<ConditionsInfo>,
    pub directions: Vec<Direction>,
    pub auto_trigger_us: u64,
    pub delay: u32,
    pub pwq_conditions: Vec<Condition>,
    pub pwq_info: Option<ConditionsInfo>,
    pub pwq_directions: Vec<Direction>,
    pub pwq_lower: u32,
    pub pwq_upper: u32,
    pub pwq_kind: PulseWidthType,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimChannel {
    pub enabled: bool,
    pub coupling: Coupling,
    pub range: usize,
    pub analog_offset: f32,
}

struct StreamState {
    request: StreamingRequest,
    target: Option<u64>,
    produced: u64,
    write_pos: u32,
    triggered: bool,
    auto_stopped: bool,
    idle_next: bool,
}

struct BlockState {
    pre_trigger: u32,
    polls: u32,
    ready: bool,
    stopped: bool,
}

pub struct SimulatedScope {
    config: SimConfig,
    channel_count: usize,
    resolution: Resolution,
    calls: Vec<String>,
    injected: HashMap<&'static str, VecDeque<PicoStatus>>,
    power_requests: Vec<PicoStatus>,
    trigger: SimTrigger,
    channels: BTreeMap<Channel, SimChannel>,
    bindings: HashMap<(Channel, u32), BufferBinding>,
    streaming: Option<StreamState>,
    segments: u32,
    captures: u32,
    block: Option<BlockState>,
    rng: StdRng,
}

impl SimulatedScope {
    pub fn new(config: SimConfig) -> Self {
        let (channel_count, _) = crate::UnitModel::parse_variant(&config.variant);
        Self {
            channel_count,
            resolution: config.resolution,
            calls: Vec::new(),
            injected: HashMap::new(),
            power_requests: Vec::new(),
            trigger: SimTrigger::default(),
            channels: BTreeMap::new(),
            bindings: HashMap::new(),
            streaming: None,
            segments: 1,
            captures: 1,
            block: None,
            rng: StdRng::seed_from_u64(config.seed),
            config,
        }
    }

    /// Makes the next call to `call` fail with `status`.
    pub fn fail_next(&mut self, call: &'static str, status: PicoStatus) {
        self.injected.entry(call).or_default().push_back(status);
    }

    /// Names of the driver calls made so far.
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn power_requests(&self) -> &[PicoStatus] {
        &self.power_requests
    }

    pub fn trigger(&self) -> &SimTrigger {
        &self.trigger
    }

    pub fn channel(&self, channel: Channel) -> Option<&SimChannel> {
        self.channels.get(&channel)
    }

    /// Number of (channel, segment) pairs the driver still holds memory for.
    pub fn live_bindings(&self) -> usize {
        self.bindings.len()
    }

    pub fn segments(&self) -> u32 {
        self.segments
    }

    pub fn captures(&self) -> u32 {
        self.captures
    }

    fn record(&mut self, call: &'static str) -> Result<(), PicoStatus> {
        self.calls.push(call.to_string());
        match self.injected.get_mut(call).and_then(VecDeque::pop_front) {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn sample(&mut self, channel: Channel, segment: u32, index: u64) -> i16 {
        let period = 200.0 + 50.0 * channel.index() as f64;
        let phase = (index as f64 + f64::from(segment) * 17.0) / period;
        let noise: f64 = self.rng.random_range(-200.0..200.0);
        (8000.0 * (phase * std::f64::consts::TAU).sin() + noise) as i16
    }

    fn fill(&mut self, channel: Channel, segment: u32, first: u64, out: &mut [i16]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.sample(channel, segment, first + i as u64);
        }
    }

    /// Writes `data` into a bound buffer at `offset`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `len` samples, which the binding contract of
    /// [`Driver::set_data_buffers`] guarantees.
    unsafe fn write_bound(
        ptr: *mut i16,
        len: usize,
        offset: usize,
        data: &[i16],
    ) -> Result<(), PicoStatus> {
        if ptr.is_null() {
            return Ok(());
        }
        if offset + data.len() > len {
            return Err(PicoStatus::TooManySamples);
        }
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len());
        Ok(())
    }

    fn enabled(&self, channel: Channel) -> bool {
        self.channels.get(&channel).is_some_and(|c| c.enabled)
    }

    fn bound_channels(&self, segment: u32) -> Vec<(Channel, BufferBinding)> {
        let mut bound: Vec<_> = self
            .bindings
            .iter()
            .filter(|((ch, seg), _)| *seg == segment && self.enabled(*ch))
            .map(|(&(ch, _), &b)| (ch, b))
            .collect();
        bound.sort_by_key(|(ch, _)| *ch);
        bound
    }

    fn interval_ns(&self, timebase: u32) -> i32 {
        match self.resolution {
            Resolution::Bits8 if timebase <= 2 => 1 << timebase,
            Resolution::Bits8 => (timebase as i32 - 2) * 8,
            _ if timebase <= 3 => 1 << timebase,
            _ => (timebase as i32 - 3) * 16,
        }
    }

    fn available_captures(&self) -> u32 {
        match &self.block {
            Some(block) if block.ready => self.captures,
            Some(block) if block.stopped => self.config.completed_on_stop.min(self.captures),
            _ => 0,
        }
    }
}

impl Driver for SimulatedScope {
    fn unit_info(&mut self, info: UnitInfo) -> Result<String, PicoStatus> {
        self.record("unit_info")?;
        Ok(match info {
            UnitInfo::VariantInfo => self.config.variant.clone(),
            UnitInfo::BatchAndSerial => self.config.serial.clone(),
            UnitInfo::CalDate => "01Jan26".to_string(),
            UnitInfo::UsbVersion => "3.0".to_string(),
            _ => "1.0.0.0".to_string(),
        })
    }

    fn current_power_source(&mut self) -> PicoStatus {
        self.calls.push("current_power_source".to_string());
        self.config.power_source
    }

    fn change_power_source(&mut self, state: PicoStatus) -> PicoStatus {
        self.calls.push("change_power_source".to_string());
        self.power_requests.push(state);
        self.config.power_replies.pop_front().unwrap_or(PicoStatus::Ok)
    }

    fn device_resolution(&mut self) -> Result<Resolution, PicoStatus> {
        self.record("device_resolution")?;
        Ok(self.resolution)
    }

    fn set_device_resolution(&mut self, resolution: Resolution) -> Result<(), PicoStatus> {
        self.record("set_device_resolution")?;
        let enabled = self.channels.values().filter(|c| c.enabled).count();
        if resolution
            .max_enabled_channels()
            .is_some_and(|max| enabled > max)
        {
            return Err(PicoStatus::InvalidNumberChannelsForResolution);
        }
        self.resolution = resolution;
        Ok(())
    }

    fn maximum_value(&mut self) -> Result<i16, PicoStatus> {
        self.record("maximum_value")?;
        Ok(match self.resolution {
            Resolution::Bits8 => 32512,
            _ => 32767,
        })
    }

    fn set_channel(
        &mut self,
        channel: Channel,
        enabled: bool,
        coupling: Coupling,
        range: usize,
        analog_offset: f32,
    ) -> Result<(), PicoStatus> {
        self.record("set_channel")?;
        if channel.index() >= self.channel_count {
            return Err(PicoStatus::InvalidChannel);
        }
        if range > LAST_RANGE {
            return Err(PicoStatus::InvalidVoltageRange);
        }
        if enabled
            && channel.index() >= DUAL_SCOPE
            && self.config.power_source == PicoStatus::PowerSupplyNotConnected
        {
            return Err(PicoStatus::Unknown(0x122));
        }
        self.channels.insert(
            channel,
            SimChannel {
                enabled,
                coupling,
                range,
                analog_offset,
            },
        );
        Ok(())
    }

    fn set_digital_port(&mut self, _port: usize, _enabled: bool) -> Result<(), PicoStatus> {
        self.record("set_digital_port")
    }

    fn minimum_timebase(
        &mut self,
        _channels: ChannelFlags,
        resolution: Resolution,
    ) -> Result<(u32, f64), PicoStatus> {
        self.record("minimum_timebase")?;
        let timebase = match resolution {
            Resolution::Bits8 => 0,
            _ => 1,
        }
        .max(self.config.min_timebase);
        Ok((timebase, f64::from(self.interval_ns(timebase)) * 1e-9))
    }

    fn timebase(
        &mut self,
        timebase: u32,
        n_samples: u32,
        _segment: u32,
    ) -> Result<TimebaseInfo, PicoStatus> {
        self.record("timebase")?;
        if timebase < self.config.min_timebase {
            return Err(PicoStatus::InvalidTimebase);
        }
        let max_samples = DEVICE_MEMORY / self.segments.max(1) as i32;
        if n_samples as i32 > max_samples {
            return Err(PicoStatus::TooManySamples);
        }
        Ok(TimebaseInfo {
            timebase,
            interval_ns: self.interval_ns(timebase),
            max_samples,
        })
    }

    fn set_trigger_channel_properties(
        &mut self,
        properties: &[ChannelProperties],
    ) -> Result<(), PicoStatus> {
        self.record("set_trigger_channel_properties")?;
        self.trigger.properties = properties.to_vec();
        Ok(())
    }

    fn set_trigger_channel_conditions(
        &mut self,
        conditions: &[Condition],
        info: ConditionsInfo,
    ) -> Result<(), PicoStatus> {
        self.record("set_trigger_channel_conditions")?;
        self.trigger.conditions = match info {
            ConditionsInfo::Clear => Vec::new(),
            ConditionsInfo::ClearAndAdd => conditions.to_vec(),
        };
        self.trigger.conditions_info = Some(info);
        Ok(())
    }

    fn set_trigger_channel_directions(
        &mut self,
        directions: &[Direction],
    ) -> Result<(), PicoStatus> {
        self.record("set_trigger_channel_directions")?;
        self.trigger.directions = directions.to_vec();
        Ok(())
    }

    fn set_auto_trigger_us(&mut self, micros: u64) -> Result<(), PicoStatus> {
        self.record("set_auto_trigger_us")?;
        self.trigger.auto_trigger_us = micros;
        Ok(())
    }

    fn set_trigger_delay(&mut self, delay: u32) -> Result<(), PicoStatus> {
        self.record("set_trigger_delay")?;
        self.trigger.delay = delay;
        Ok(())
    }

    fn set_pulse_width_qualifier_conditions(
        &mut self,
        conditions: &[Condition],
        info: ConditionsInfo,
    ) -> Result<(), PicoStatus> {
        self.record("set_pulse_width_qualifier_conditions")?;
        self.trigger.pwq_conditions = match info {
            ConditionsInfo::Clear => Vec::new(),
            ConditionsInfo::ClearAndAdd => conditions.to_vec(),
        };
        self.trigger.pwq_info = Some(info);
        Ok(())
    }

    fn set_pulse_width_qualifier_directions(
        &mut self,
        directions: &[Direction],
    ) -> Result<(), PicoStatus> {
        self.record("set_pulse_width_qualifier_directions")?;
        self.trigger.pwq_directions = directions.to_vec();
        Ok(())
    }

    fn set_pulse_width_qualifier_properties(
        &mut self,
        lower: u32,
        upper: u32,
        kind: PulseWidthType,
    ) -> Result<(), PicoStatus> {
        self.record("set_pulse_width_qualifier_properties")?;
        self.trigger.pwq_lower = lower;
        self.trigger.pwq_upper = upper;
        self.trigger.pwq_kind = kind;
        Ok(())
    }

    fn set_simple_trigger(
        &mut self,
        enabled: bool,
        source: Channel,
        threshold: i16,
        direction: ThresholdDirection,
        delay: u32,
        auto_trigger_ms: i16,
    ) -> Result<(), PicoStatus> {
        self.record("set_simple_trigger")?;
        self.trigger = SimTrigger {
            delay,
            auto_trigger_us: u64::from(auto_trigger_ms.max(0) as u16) * 1000,
            ..SimTrigger::default()
        };
        if enabled {
            self.trigger.properties = vec![ChannelProperties {
                threshold_upper: threshold,
                threshold_upper_hysteresis: 0,
                threshold_lower: threshold,
                threshold_lower_hysteresis: 0,
                channel: source,
            }];
            self.trigger.conditions = vec![Condition {
                source,
                state: crate::TriggerState::True,
            }];
            self.trigger.directions = vec![Direction {
                source,
                direction,
                mode: crate::ThresholdMode::Level,
            }];
        }
        Ok(())
    }

    unsafe fn set_data_buffers(
        &mut self,
        channel: Channel,
        segment: u32,
        buffers: Option<BufferBinding>,
    ) -> Result<(), PicoStatus> {
        self.record("set_data_buffers")?;
        if channel.index() >= self.channel_count {
            return Err(PicoStatus::InvalidChannel);
        }
        match buffers {
            Some(binding) => {
                if binding.max.is_null() && binding.min.is_null() {
                    return Err(PicoStatus::NullParameter);
                }
                self.bindings.insert((channel, segment), binding);
            }
            None => {
                self.bindings.remove(&(channel, segment));
            }
        }
        Ok(())
    }

    fn run_streaming(&mut self, request: &StreamingRequest) -> Result<u32, PicoStatus> {
        self.record("run_streaming")?;
        if request.overview_len == 0 || request.downsample_ratio == 0 {
            return Err(PicoStatus::InvalidParameter);
        }
        let target = request.auto_stop.then(|| {
            u64::from(request.pre_trigger + request.post_trigger)
                / u64::from(request.downsample_ratio)
        });
        self.streaming = Some(StreamState {
            request: *request,
            target,
            produced: 0,
            write_pos: 0,
            triggered: false,
            auto_stopped: false,
            idle_next: false,
        });
        Ok(request.sample_interval)
    }

    fn streaming_latest_values(&mut self) -> Result<Option<StreamingReady>, PicoStatus> {
        self.record("streaming_latest_values")?;
        let chunk_len = self.config.chunk_len;
        let idle_polls = self.config.idle_polls;
        let trigger_at = self.config.streaming_trigger_at;
        let trigger_installed = !self.trigger.conditions.is_empty();

        let Some(state) = self.streaming.as_mut() else {
            return Err(PicoStatus::StreamingFailed);
        };
        if state.auto_stopped {
            return Ok(None);
        }
        if idle_polls {
            state.idle_next = !state.idle_next;
            if !state.idle_next {
                return Ok(None);
            }
        }

        let remaining = state.target.map_or(u64::MAX, |t| t - state.produced);
        let overview = state.request.overview_len;
        let n = u64::from(chunk_len.min(overview)).min(remaining) as u32;
        if state.write_pos + n > overview {
            state.write_pos = 0;
        }
        let start = state.write_pos;
        let first = state.produced;
        let mode = state.request.ratio_mode;

        let mut ready = StreamingReady {
            n_samples: n,
            start_index: start,
            ..StreamingReady::default()
        };
        if let Some(at) = trigger_at.filter(|_| trigger_installed && !state.triggered) {
            if at >= first && at < first + u64::from(n) {
                state.triggered = true;
                ready.triggered = true;
                ready.trigger_at = (at - first) as u32;
            }
        }
        state.produced += u64::from(n);
        state.write_pos += n;
        if state.target.is_some_and(|t| state.produced >= t) {
            state.auto_stopped = true;
            ready.auto_stop = true;
        }

        let mut data = vec![0i16; n as usize];
        for (channel, binding) in self.bound_channels(0) {
            self.fill(channel, 0, first, &mut data);
            // SAFETY: the binding is live, so its memory is valid for `len`.
            unsafe {
                Self::write_bound(binding.max, binding.len, start as usize, &data)?;
                if mode == RatioMode::Aggregate {
                    let min: Vec<i16> = data.iter().map(|v| v.saturating_sub(64)).collect();
                    Self::write_bound(binding.min, binding.len, start as usize, &min)?;
                }
            }
            if data.iter().any(|&v| v == i16::MAX || v == i16::MIN) {
                ready.overflow |= 1 << channel.index();
            }
        }

        Ok(Some(ready))
    }

    fn max_segments(&mut self) -> Result<u32, PicoStatus> {
        self.record("max_segments")?;
        Ok(self.config.max_segments)
    }

    fn memory_segments(&mut self, n_segments: u32) -> Result<i32, PicoStatus> {
        self.record("memory_segments")?;
        if n_segments == 0 || n_segments > self.config.max_segments {
            return Err(PicoStatus::TooManySegments);
        }
        self.segments = n_segments;
        Ok(DEVICE_MEMORY / n_segments as i32)
    }

    fn set_no_of_captures(&mut self, n_captures: u32) -> Result<(), PicoStatus> {
        self.record("set_no_of_captures")?;
        if n_captures == 0 || n_captures > self.segments {
            return Err(PicoStatus::TooManySegments);
        }
        self.captures = n_captures;
        Ok(())
    }

    fn run_block(
        &mut self,
        pre_trigger: u32,
        post_trigger: u32,
        timebase: u32,
        _segment: u32,
    ) -> Result<i32, PicoStatus> {
        self.record("run_block")?;
        if timebase < self.config.min_timebase {
            return Err(PicoStatus::InvalidTimebase);
        }
        if pre_trigger + post_trigger == 0 {
            return Err(PicoStatus::InvalidParameter);
        }
        self.block = Some(BlockState {
            pre_trigger,
            polls: 0,
            ready: false,
            stopped: false,
        });
        Ok(0)
    }

    fn is_ready(&mut self) -> Result<bool, PicoStatus> {
        self.record("is_ready")?;
        let ready_after = self.config.ready_after_polls;
        let block = self.block.as_mut().ok_or(PicoStatus::BlockModeFailed)?;
        block.polls += 1;
        if ready_after.is_some_and(|k| block.polls >= k) {
            block.ready = true;
        }
        Ok(block.ready)
    }

    fn no_of_captures(&mut self) -> Result<u32, PicoStatus> {
        self.record("no_of_captures")?;
        Ok(self.available_captures())
    }

    fn values_bulk(
        &mut self,
        n_samples: u32,
        from: u32,
        to: u32,
        _downsample_ratio: u32,
        _mode: RatioMode,
        overflow: &mut [i16],
    ) -> Result<u32, PicoStatus> {
        self.record("values_bulk")?;
        if from > to || to >= self.available_captures() {
            return Err(PicoStatus::SegmentOutOfRange);
        }
        if overflow.len() < (to - from + 1) as usize {
            return Err(PicoStatus::InvalidParameter);
        }
        let mut data = vec![0i16; n_samples as usize];
        for segment in from..=to {
            overflow[(segment - from) as usize] = 0;
            for (channel, binding) in self.bound_channels(segment) {
                let n = (n_samples as usize).min(binding.len);
                self.fill(channel, segment, 0, &mut data[..n]);
                // SAFETY: the binding is live, so its memory is valid for `len`.
                unsafe { Self::write_bound(binding.max, binding.len, 0, &data[..n])? };
            }
        }
        Ok(n_samples)
    }

    fn trigger_info_bulk(
        &mut self,
        info: &mut [TriggerInfo],
        from: u32,
        to: u32,
    ) -> Result<(), PicoStatus> {
        self.record("trigger_info_bulk")?;
        if from > to || to >= self.available_captures() {
            return Err(PicoStatus::SegmentOutOfRange);
        }
        if info.len() < (to - from + 1) as usize {
            return Err(PicoStatus::InvalidParameter);
        }
        let pre_trigger = self.block.as_ref().map_or(0, |b| b.pre_trigger);
        for segment in from..=to {
            let status = if self.config.bad_timestamp_segments.contains(&segment) {
                PicoStatus::Unknown(TIME_STAMP_RESET)
            } else {
                PicoStatus::Ok
            };
            info[(segment - from) as usize] = TriggerInfo {
                status,
                segment_index: segment,
                trigger_index: pre_trigger,
                trigger_time: 0,
                time_units: TimeUnits::Ns,
                timestamp_counter: 1_000_000 + u64::from(segment) * self.config.timestamp_stride,
            };
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PicoStatus> {
        self.record("stop")?;
        if let Some(block) = self.block.as_mut() {
            block.stopped = true;
        }
        if let Some(stream) = self.streaming.as_mut() {
            stream.auto_stopped = true;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), PicoStatus> {
        self.record("close")?;
        self.bindings.clear();
        Ok(())
    }
}
