use crate::{
    apply_trigger, AcqError, BufferBinding, CancelSignal, Channel, ConfigError, Driver,
    Negotiation, RatioMode, Scope, StepContext, TimebaseInfo, TriggerInfo, TriggerSpec,
    MAX_ARM_RETRIES,
};
use log::{debug, info, warn};
use ndarray::Array2;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct RapidBlockSettings {
    /// Waveforms asked for; capped at the device's segment count.
    pub waveforms: u32,
    /// Samples per waveform; must equal `pre_trigger + post_trigger`.
    pub samples: u32,
    pub pre_trigger: u32,
    pub post_trigger: u32,
    /// First timebase index to try.
    pub timebase: u32,
    pub downsample_ratio: u32,
    pub ratio_mode: RatioMode,
    pub poll_interval: Duration,
    pub trigger: TriggerSpec,
}

impl Default for RapidBlockSettings {
    fn default() -> Self {
        Self {
            waveforms: 10,
            samples: 2000,
            pre_trigger: 500,
            post_trigger: 1500,
            timebase: 1,
            downsample_ratio: 1,
            ratio_mode: RatioMode::None,
            poll_interval: Duration::from_millis(10),
            trigger: TriggerSpec::default(),
        }
    }
}

impl RapidBlockSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.waveforms == 0 {
            return Err(ConfigError::Zero("waveform count"));
        }
        if self.samples == 0 {
            return Err(ConfigError::Zero("samples per waveform"));
        }
        if self.downsample_ratio == 0 {
            return Err(ConfigError::Zero("downsample ratio"));
        }
        if self.pre_trigger.checked_add(self.post_trigger) != Some(self.samples) {
            return Err(ConfigError::TriggerSplit {
                pre: self.pre_trigger,
                post: self.post_trigger,
                samples: self.samples,
            });
        }
        Ok(())
    }
}

/// One captured waveform.
#[derive(Clone, Debug)]
pub struct Segment {
    pub index: u32,
    /// One row per captured channel, in [`RapidBlockResult::channels`] order.
    pub data: Array2<i16>,
    pub overflow: i16,
    pub trigger: TriggerInfo,
    /// Time since the previous segment's trigger; `None` for segment 0 and
    /// whenever either timing record is unusable.
    pub elapsed_ns: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockEnd {
    Completed,
    /// Stopped early; only the captures finished by then were retrieved.
    Cancelled,
    PowerAborted,
}

#[derive(Clone, Debug)]
pub struct RapidBlockResult {
    pub requested: u32,
    /// Segments the device memory was split into.
    pub segments_configured: u32,
    pub timebase: Option<TimebaseInfo>,
    pub channels: Vec<Channel>,
    /// Samples per segment actually returned by the device.
    pub samples: u32,
    pub segments: Vec<Segment>,
    pub end: BlockEnd,
}

impl RapidBlockResult {
    fn empty(requested: u32, end: BlockEnd) -> Self {
        Self {
            requested,
            segments_configured: 0,
            timebase: None,
            channels: Vec::new(),
            samples: 0,
            segments: Vec::new(),
            end,
        }
    }

    pub fn captures(&self) -> usize {
        self.segments.len()
    }
}

/// Time between consecutive segment triggers, in ns.
///
/// Entry `i` is the gap from segment `i - 1` to segment `i`. Segment 0 has
/// no predecessor, and a record with a non-OK status is never diffed.
pub fn elapsed_times(infos: &[TriggerInfo], tick_ns: u64) -> Vec<Option<u64>> {
    let mut out = Vec::with_capacity(infos.len());
    for (i, info) in infos.iter().enumerate() {
        let elapsed = match i.checked_sub(1).map(|p| &infos[p]) {
            Some(prev) if prev.status.is_ok() && info.status.is_ok() => Some(
                info.timestamp_counter
                    .wrapping_sub(prev.timestamp_counter)
                    .saturating_mul(tick_ns),
            ),
            _ => None,
        };
        out.push(elapsed);
    }
    out
}

/// Device-side setup that survived arming.
struct Armed {
    segments: u32,
    timebase: TimebaseInfo,
    end: BlockEnd,
}

/// Many triggered waveforms captured back to back into device segments.
pub struct RapidBlockCapture<'s, D: Driver> {
    scope: &'s mut Scope<D>,
    settings: RapidBlockSettings,
}

impl<'s, D: Driver> RapidBlockCapture<'s, D> {
    pub fn new(scope: &'s mut Scope<D>, settings: RapidBlockSettings) -> Self {
        Self { scope, settings }
    }

    /// Arms, waits for completion or `cancel`, and retrieves whatever was
    /// captured. The device is stopped on every path.
    pub fn capture(&mut self, cancel: &CancelSignal) -> Result<RapidBlockResult, AcqError> {
        self.settings.validate()?;
        let channels = self.scope.unit().enabled_channels();
        if channels.is_empty() {
            return Err(ConfigError::NoChannelEnabled.into());
        }

        let armed = self.arm_and_wait(cancel);
        let stopped = self.scope.driver_mut().stop().at("stop");
        let armed = armed?;
        stopped?;

        let requested = self.settings.waveforms;
        let Some(armed) = armed else {
            warn!("Rapid block capture aborted by power negotiation");
            return Ok(RapidBlockResult::empty(requested, BlockEnd::PowerAborted));
        };

        let captures = match armed.end {
            BlockEnd::Completed => armed.segments,
            _ => {
                let done = self
                    .scope
                    .driver_mut()
                    .no_of_captures()
                    .at("get number of captures")?;
                info!("Cancelled after {done} of {} captures", armed.segments);
                done.min(armed.segments)
            }
        };

        let mut result = RapidBlockResult {
            requested,
            segments_configured: armed.segments,
            timebase: Some(armed.timebase),
            channels,
            samples: 0,
            segments: Vec::new(),
            end: armed.end,
        };
        if captures == 0 {
            info!("No captures completed");
            return Ok(result);
        }
        self.retrieve(&mut result, captures)?;
        info!(
            "Retrieved {} segment(s) of {} samples on {} channel(s)",
            result.segments.len(),
            result.samples,
            result.channels.len()
        );
        Ok(result)
    }

    fn arm_and_wait(&mut self, cancel: &CancelSignal) -> Result<Option<Armed>, AcqError> {
        let s = &self.settings;
        apply_trigger(self.scope.driver_mut(), &s.trigger)?;

        let max_segments = self
            .scope
            .driver_mut()
            .max_segments()
            .at("get max segments")?;
        let segments = s.waveforms.min(max_segments);
        if segments < s.waveforms {
            warn!(
                "{} waveforms requested, the device holds at most {max_segments}",
                s.waveforms
            );
        }
        let max_samples = self
            .scope
            .driver_mut()
            .memory_segments(segments)
            .at("set memory segments")?;
        debug!("{segments} segments of up to {max_samples} samples");
        self.scope
            .driver_mut()
            .set_no_of_captures(segments)
            .at("set number of captures")?;

        let timebase = self
            .scope
            .negotiate_timebase(s.timebase, s.samples, 0)?;
        info!(
            "Timebase {} ({} ns) for {segments} captures of {} samples",
            timebase.timebase, timebase.interval_ns, s.samples
        );

        let (pre, post) = (s.pre_trigger, s.post_trigger);
        let Some(_busy_ms) = self.scope.retry_on_power("run block", |d| {
            d.run_block(pre, post, timebase.timebase, 0)
        })?
        else {
            return Ok(None);
        };

        info!("Waiting for trigger, press q to abort");
        let mut power_events = 0;
        let end = loop {
            match self.scope.driver_mut().is_ready() {
                Ok(true) => break BlockEnd::Completed,
                Ok(false) => {}
                Err(status) if status.is_power_condition() && power_events < MAX_ARM_RETRIES => {
                    power_events += 1;
                    warn!("Power source changed while waiting for captures: {status}");
                    if let Negotiation::Abort = self.scope.negotiate(status)? {
                        return Ok(None);
                    }
                }
                Err(status) => return Err(status).at("is ready"),
            }
            if cancel.wait_for(self.settings.poll_interval) {
                break BlockEnd::Cancelled;
            }
        };

        Ok(Some(Armed {
            segments,
            timebase,
            end,
        }))
    }

    /// Binds one row per channel per segment, pulls values and timing, and
    /// unbinds again before returning.
    fn retrieve(&mut self, result: &mut RapidBlockResult, captures: u32) -> Result<(), AcqError> {
        let n = self.settings.samples as usize;
        let rows = result.channels.len();
        let mut data: Vec<Array2<i16>> = (0..captures)
            .map(|_| Array2::zeros((rows, n)))
            .collect();

        let mut bound = Vec::with_capacity(captures as usize * rows);
        let pulled = self.bind_and_pull(&mut data, &result.channels, &mut bound, captures);

        let driver = self.scope.driver_mut();
        let mut unbind_err = None;
        for &(channel, segment) in &bound {
            if let Err(e) = driver.clear_data_buffers(channel, segment).at("clear data buffers") {
                unbind_err.get_or_insert(e);
            }
        }
        if let Some(e) = unbind_err {
            warn!("Leaking segment buffers, the driver may still write to them");
            std::mem::forget(data);
            return Err(pulled.err().unwrap_or(e));
        }
        let (samples, overflow, infos) = pulled?;

        let tick_ns = result
            .timebase
            .map_or(0, |tb| u64::try_from(tb.interval_ns).unwrap_or(0));
        let elapsed = elapsed_times(&infos, tick_ns);
        result.samples = samples;
        result.segments = data
            .into_iter()
            .zip(overflow)
            .zip(infos)
            .zip(elapsed)
            .enumerate()
            .map(|(i, (((data, overflow), trigger), elapsed_ns))| {
                if overflow != 0 {
                    warn!("Over range in segment {i}: 0b{overflow:04b}");
                }
                if !trigger.status.is_ok() {
                    debug!("Segment {i} timing record: {}", trigger.status);
                }
                Segment {
                    index: i as u32,
                    data,
                    overflow,
                    trigger,
                    elapsed_ns,
                }
            })
            .collect();
        Ok(())
    }

    fn bind_and_pull(
        &mut self,
        data: &mut [Array2<i16>],
        channels: &[Channel],
        bound: &mut Vec<(Channel, u32)>,
        captures: u32,
    ) -> Result<(u32, Vec<i16>, Vec<TriggerInfo>), AcqError> {
        let n = self.settings.samples as usize;
        let mode = self.settings.ratio_mode;
        let driver = self.scope.driver_mut();

        for (segment, block) in data.iter_mut().enumerate() {
            let base = block.as_mut_ptr();
            for (row, &channel) in channels.iter().enumerate() {
                let binding = BufferBinding {
                    max: base.wrapping_add(row * n),
                    min: std::ptr::null_mut(),
                    len: n,
                    mode,
                };
                // SAFETY: each row is `n` contiguous samples of a standard
                // layout array that is neither moved nor freed until the
                // binding is cleared in `retrieve`.
                unsafe { driver.set_data_buffers(channel, segment as u32, Some(binding)) }
                    .at("set data buffers")?;
                bound.push((channel, segment as u32));
            }
        }

        let last = captures - 1;
        let mut overflow = vec![0i16; captures as usize];
        let samples = match driver.values_bulk(
            n as u32,
            0,
            last,
            self.settings.downsample_ratio,
            mode,
            &mut overflow,
        ) {
            Ok(samples) => samples,
            Err(status) if status.is_power_condition() => {
                warn!("Power source changed during data retrieval: {status}");
                return Err(AcqError::PowerInterrupted {
                    step: "get values bulk",
                    status,
                });
            }
            Err(status) => return Err(status).at("get values bulk"),
        };

        let mut infos = vec![TriggerInfo::default(); captures as usize];
        driver
            .trigger_info_bulk(&mut infos, 0, last)
            .at("get trigger info bulk")?;
        Ok((samples, overflow, infos))
    }
}
