use crate::{
    apply_trigger, AcqError, BufferPool, CancelSignal, ConfigError, Driver, Negotiation,
    RatioMode, Scope, StepContext, StreamingRequest, TimeUnits, TriggerSpec, UnitModel,
};
use log::{debug, info, warn};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct StreamingSettings {
    /// Requested interval between samples; the device may adjust it.
    pub sample_interval: u32,
    pub time_units: TimeUnits,
    pub pre_trigger: u32,
    pub post_trigger: u32,
    pub auto_stop: bool,
    pub downsample_ratio: u32,
    pub ratio_mode: RatioMode,
    /// Overview buffer size per channel. One poll never reports more.
    pub overview_len: u32,
    /// Pause after a poll that returned nothing.
    pub poll_interval: Duration,
    pub trigger: TriggerSpec,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            sample_interval: 1,
            time_units: TimeUnits::Us,
            pre_trigger: 0,
            post_trigger: 1_000_000,
            auto_stop: true,
            downsample_ratio: 1,
            ratio_mode: RatioMode::None,
            overview_len: 50_000,
            poll_interval: Duration::from_millis(1),
            trigger: TriggerSpec::default(),
        }
    }
}

impl StreamingSettings {
    fn validate(&self, unit: &UnitModel) -> Result<(), ConfigError> {
        if self.overview_len == 0 {
            return Err(ConfigError::Zero("overview buffer length"));
        }
        if self.downsample_ratio == 0 {
            return Err(ConfigError::Zero("downsample ratio"));
        }
        if self.auto_stop && self.pre_trigger + self.post_trigger == 0 {
            return Err(ConfigError::Zero("sample count"));
        }
        if unit.enabled_channels().is_empty() {
            return Err(ConfigError::NoChannelEnabled);
        }
        Ok(())
    }

    fn request(&self) -> StreamingRequest {
        StreamingRequest {
            sample_interval: self.sample_interval,
            time_units: self.time_units,
            pre_trigger: self.pre_trigger,
            post_trigger: self.post_trigger,
            auto_stop: self.auto_stop,
            downsample_ratio: self.downsample_ratio,
            ratio_mode: self.ratio_mode,
            overview_len: self.overview_len,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Configured,
    Armed,
    Polling,
    Stopped,
    Aborted,
}

/// Why a streaming run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// The device collected everything it was asked for.
    AutoStop,
    Cancelled,
    /// A power condition the operator declined to resolve.
    PowerAborted,
}

impl StreamEnd {
    pub fn is_success(self) -> bool {
        matches!(self, StreamEnd::AutoStop)
    }
}

/// Samples reported by one poll, already copied to the application side.
pub struct StreamChunk<'a> {
    pub pool: &'a BufferPool,
    pub unit: &'a UnitModel,
    /// Position of the samples in the pool's buffers.
    pub start: usize,
    pub count: usize,
    /// Absolute index of the first sample of this chunk.
    pub first_sample: u64,
    pub trigger_at: Option<u64>,
    /// Bit per channel that went over range.
    pub overflow: i16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamingSummary {
    pub total_samples: u64,
    /// Absolute sample index of the first reported trigger.
    pub trigger_at: Option<u64>,
    pub end: StreamEnd,
    pub polls: usize,
    /// Power conditions negotiated without ending the run.
    pub power_changes: usize,
    pub overflowed: bool,
    /// Interval the device actually used.
    pub sample_interval: u32,
    pub time_units: TimeUnits,
}

pub trait StreamObserver {
    /// Called once per non-empty poll, before the next poll is issued.
    fn on_chunk(&mut self, chunk: &StreamChunk<'_>) -> Result<(), AcqError>;

    fn on_end(&mut self, _summary: &StreamingSummary) -> Result<(), AcqError> {
        Ok(())
    }
}

impl<T: StreamObserver + ?Sized> StreamObserver for Box<T> {
    fn on_chunk(&mut self, chunk: &StreamChunk<'_>) -> Result<(), AcqError> {
        (**self).on_chunk(chunk)
    }

    fn on_end(&mut self, summary: &StreamingSummary) -> Result<(), AcqError> {
        (**self).on_end(summary)
    }
}

/// Observer that keeps nothing.
pub struct Discard;

impl StreamObserver for Discard {
    fn on_chunk(&mut self, _chunk: &StreamChunk<'_>) -> Result<(), AcqError> {
        Ok(())
    }
}

/// One continuous streaming acquisition.
///
/// `Configured -> Armed -> Polling -> Stopped | Aborted`. The device is
/// always stopped and the buffers released on the way out, whatever the
/// outcome.
pub struct StreamingSession<'s, D: Driver> {
    scope: &'s mut Scope<D>,
    settings: StreamingSettings,
    state: SessionState,
}

impl<'s, D: Driver> StreamingSession<'s, D> {
    pub fn new(scope: &'s mut Scope<D>, settings: StreamingSettings) -> Self {
        Self {
            scope,
            settings,
            state: SessionState::Configured,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn run(
        &mut self,
        cancel: &CancelSignal,
        observer: &mut dyn StreamObserver,
    ) -> Result<StreamingSummary, AcqError> {
        self.settings.validate(self.scope.unit())?;
        let (driver, unit) = self.scope.parts();
        apply_trigger(driver, &self.settings.trigger)?;
        let mut pool = BufferPool::allocate(unit, self.settings.overview_len as usize)?;

        let outcome = pool
            .bind_to_device(driver, self.settings.ratio_mode)
            .and_then(|()| self.stream(&mut pool, cancel, observer));

        let (driver, _) = self.scope.parts();
        let stopped = driver.stop().at("stop");
        let released = pool.release(driver);

        let summary = match outcome.and_then(|s| stopped.and(released).map(|()| s)) {
            Ok(summary) => summary,
            Err(e) => {
                self.state = SessionState::Aborted;
                return Err(e);
            }
        };

        self.state = if summary.end.is_success() {
            info!(
                "Streaming finished with {} samples over {} polls",
                summary.total_samples, summary.polls
            );
            SessionState::Stopped
        } else {
            warn!("Data collection aborted after {} samples", summary.total_samples);
            SessionState::Aborted
        };
        observer.on_end(&summary)?;
        Ok(summary)
    }

    fn stream(
        &mut self,
        pool: &mut BufferPool,
        cancel: &CancelSignal,
        observer: &mut dyn StreamObserver,
    ) -> Result<StreamingSummary, AcqError> {
        self.state = SessionState::Armed;
        let request = self.settings.request();
        let mut summary = StreamingSummary {
            total_samples: 0,
            trigger_at: None,
            end: StreamEnd::PowerAborted,
            polls: 0,
            power_changes: 0,
            overflowed: false,
            sample_interval: request.sample_interval,
            time_units: request.time_units,
        };

        let Some(interval) = self
            .scope
            .retry_on_power("run streaming", |d| d.run_streaming(&request))?
        else {
            return Ok(summary);
        };
        summary.sample_interval = interval;
        info!(
            "Streaming data at {interval} {:?} intervals, press q to stop",
            request.time_units
        );

        self.state = SessionState::Polling;
        loop {
            if cancel.is_cancelled() {
                summary.end = StreamEnd::Cancelled;
                break;
            }

            let (driver, _) = self.scope.parts();
            let ready = match driver.streaming_latest_values() {
                Ok(Some(ready)) => ready,
                Ok(None) => {
                    cancel.wait_for(self.settings.poll_interval);
                    continue;
                }
                Err(status) if status.is_power_condition() => {
                    warn!("Power source changed during streaming: {status}");
                    if let Negotiation::Abort = self.scope.negotiate(status)? {
                        summary.end = StreamEnd::PowerAborted;
                        break;
                    }
                    summary.power_changes += 1;
                    continue;
                }
                Err(status) => return Err(status).at("get streaming latest values"),
            };
            summary.polls += 1;

            if ready.triggered && summary.trigger_at.is_none() {
                let at = summary.total_samples + u64::from(ready.trigger_at);
                info!("Trigger at sample {at}");
                summary.trigger_at = Some(at);
            }

            if ready.n_samples > 0 {
                let start = ready.start_index as usize;
                let count = ready.n_samples as usize;
                pool.on_samples_ready(start, count)?;
                debug!("Collected {count} samples, index = {start}");
                if ready.overflow != 0 {
                    warn!("Over range on channels 0b{:04b}", ready.overflow);
                    summary.overflowed = true;
                }
                observer.on_chunk(&StreamChunk {
                    pool,
                    unit: self.scope.unit(),
                    start,
                    count,
                    first_sample: summary.total_samples,
                    trigger_at: summary.trigger_at,
                    overflow: ready.overflow,
                })?;
                summary.total_samples += u64::from(ready.n_samples);
            }

            if ready.auto_stop {
                summary.end = StreamEnd::AutoStop;
                break;
            }
        }
        Ok(summary)
    }
}
