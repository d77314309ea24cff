#![allow(non_snake_case, non_camel_case_types)]

use crate::{
    BufferBinding, Channel, ChannelFlags, ChannelProperties, Condition, ConditionsInfo, Coupling,
    Direction, Driver, PicoStatus, PulseWidthType, RatioMode, Resolution, StreamingReady,
    StreamingRequest, ThresholdDirection, TimeUnits, TimebaseInfo, TriggerInfo, UnitInfo,
};
use libc::c_void;
use log::warn;
use std::{ffi::CString, ptr};

const DIGITAL_PORT0: u32 = 0x80;
const INFO_LEN: usize = 80;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct PS5000A_TRIGGER_CHANNEL_PROPERTIES_V2 {
    thresholdUpper: i16,
    thresholdUpperHysteresis: u16,
    thresholdLower: i16,
    thresholdLowerHysteresis: u16,
    channel: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct PS5000A_CONDITION {
    source: u32,
    condition: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct PS5000A_DIRECTION {
    channel: u32,
    direction: u32,
    mode: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
struct PS5000A_TRIGGER_INFO {
    status: u32,
    segmentIndex: u32,
    triggerIndex: u32,
    triggerTime: i64,
    timeUnits: i16,
    reserved0: i16,
    timeStampCounter: u64,
}

type StreamingReadyCallback = extern "C" fn(
    handle: i16,
    noOfSamples: i32,
    startIndex: u32,
    overflow: i16,
    triggerAt: u32,
    triggered: i16,
    autoStop: i16,
    pParameter: *mut c_void,
);

#[link(name = "ps5000a")]
extern "C" {
    fn ps5000aOpenUnit(handle: *mut i16, serial: *mut i8, resolution: u32) -> u32;
    fn ps5000aCloseUnit(handle: i16) -> u32;
    fn ps5000aGetUnitInfo(
        handle: i16,
        string: *mut i8,
        stringLength: i16,
        requiredSize: *mut i16,
        info: u32,
    ) -> u32;
    fn ps5000aCurrentPowerSource(handle: i16) -> u32;
    fn ps5000aChangePowerSource(handle: i16, powerState: u32) -> u32;
    fn ps5000aGetDeviceResolution(handle: i16, resolution: *mut u32) -> u32;
    fn ps5000aSetDeviceResolution(handle: i16, resolution: u32) -> u32;
    fn ps5000aMaximumValue(handle: i16, value: *mut i16) -> u32;
    fn ps5000aSetChannel(
        handle: i16,
        channel: u32,
        enabled: i16,
        coupling: u32,
        range: u32,
        analogOffset: f32,
    ) -> u32;
    fn ps5000aSetDigitalPort(handle: i16, port: u32, enabled: i16, logicLevel: i16) -> u32;
    fn ps5000aGetMinimumTimebaseStateless(
        handle: i16,
        enabledChannelOrPortFlags: u32,
        timebase: *mut u32,
        timeInterval: *mut f64,
        resolution: u32,
    ) -> u32;
    fn ps5000aGetTimebase(
        handle: i16,
        timebase: u32,
        noSamples: i32,
        timeIntervalNanoseconds: *mut i32,
        maxSamples: *mut i32,
        segmentIndex: u32,
    ) -> u32;
    fn ps5000aSetTriggerChannelPropertiesV2(
        handle: i16,
        channelProperties: *mut PS5000A_TRIGGER_CHANNEL_PROPERTIES_V2,
        nChannelProperties: i16,
        auxOutputEnable: i16,
    ) -> u32;
    fn ps5000aSetTriggerChannelConditionsV2(
        handle: i16,
        conditions: *mut PS5000A_CONDITION,
        nConditions: i16,
        info: u32,
    ) -> u32;
    fn ps5000aSetTriggerChannelDirectionsV2(
        handle: i16,
        directions: *mut PS5000A_DIRECTION,
        nDirections: u16,
    ) -> u32;
    fn ps5000aSetAutoTriggerMicroSeconds(handle: i16, autoTriggerMicroseconds: u64) -> u32;
    fn ps5000aSetTriggerDelay(handle: i16, delay: u32) -> u32;
    fn ps5000aSetPulseWidthQualifierConditions(
        handle: i16,
        conditions: *mut PS5000A_CONDITION,
        nConditions: i16,
        info: u32,
    ) -> u32;
    fn ps5000aSetPulseWidthQualifierDirections(
        handle: i16,
        directions: *mut PS5000A_DIRECTION,
        nDirections: i16,
    ) -> u32;
    fn ps5000aSetPulseWidthQualifierProperties(
        handle: i16,
        lower: u32,
        upper: u32,
        kind: u32,
    ) -> u32;
    fn ps5000aSetSimpleTrigger(
        handle: i16,
        enable: i16,
        source: u32,
        threshold: i16,
        direction: u32,
        delay: u32,
        autoTrigger_ms: i16,
    ) -> u32;
    fn ps5000aSetDataBuffers(
        handle: i16,
        source: u32,
        bufferMax: *mut i16,
        bufferMin: *mut i16,
        bufferLth: i32,
        segmentIndex: u32,
        mode: u32,
    ) -> u32;
    fn ps5000aRunStreaming(
        handle: i16,
        sampleInterval: *mut u32,
        sampleIntervalTimeUnits: u32,
        maxPreTriggerSamples: u32,
        maxPostTriggerSamples: u32,
        autoStop: i16,
        downSampleRatio: u32,
        downSampleRatioMode: u32,
        overviewBufferSize: u32,
    ) -> u32;
    fn ps5000aGetStreamingLatestValues(
        handle: i16,
        lpPs5000aReady: StreamingReadyCallback,
        pParameter: *mut c_void,
    ) -> u32;
    fn ps5000aGetMaxSegments(handle: i16, maxSegments: *mut u32) -> u32;
    fn ps5000aMemorySegments(handle: i16, nSegments: u32, nMaxSamples: *mut i32) -> u32;
    fn ps5000aSetNoOfCaptures(handle: i16, nCaptures: u32) -> u32;
    fn ps5000aRunBlock(
        handle: i16,
        noOfPreTriggerSamples: i32,
        noOfPostTriggerSamples: i32,
        timebase: u32,
        timeIndisposedMs: *mut i32,
        segmentIndex: u32,
        lpReady: *mut c_void,
        pParameter: *mut c_void,
    ) -> u32;
    fn ps5000aIsReady(handle: i16, ready: *mut i16) -> u32;
    fn ps5000aGetNoOfCaptures(handle: i16, nCaptures: *mut u32) -> u32;
    fn ps5000aGetValuesBulk(
        handle: i16,
        noOfSamples: *mut u32,
        fromSegmentIndex: u32,
        toSegmentIndex: u32,
        downSampleRatio: u32,
        downSampleRatioMode: u32,
        overflow: *mut i16,
    ) -> u32;
    fn ps5000aGetTriggerInfoBulk(
        handle: i16,
        triggerInfo: *mut PS5000A_TRIGGER_INFO,
        fromSegmentIndex: u32,
        toSegmentIndex: u32,
    ) -> u32;
    fn ps5000aStop(handle: i16) -> u32;
}

/// Runs inside `ps5000aGetStreamingLatestValues` on the polling thread.
extern "C" fn on_streaming_ready(
    _handle: i16,
    no_of_samples: i32,
    start_index: u32,
    overflow: i16,
    trigger_at: u32,
    triggered: i16,
    auto_stop: i16,
    parameter: *mut c_void,
) {
    if parameter.is_null() {
        return;
    }
    // SAFETY: `parameter` is the `Option<StreamingReady>` passed by
    // `streaming_latest_values`, alive for the whole driver call.
    let slot = unsafe { &mut *(parameter as *mut Option<StreamingReady>) };
    *slot = Some(StreamingReady {
        n_samples: no_of_samples.max(0) as u32,
        start_index,
        overflow,
        trigger_at,
        triggered: triggered != 0,
        auto_stop: auto_stop != 0,
    });
}

fn clamp_i16(n: usize) -> i16 {
    n.min(i16::MAX as usize) as i16
}

fn conditions(list: &[Condition]) -> Vec<PS5000A_CONDITION> {
    list.iter()
        .map(|c| PS5000A_CONDITION {
            source: c.source as u32,
            condition: c.state as u32,
        })
        .collect()
}

fn directions(list: &[Direction]) -> Vec<PS5000A_DIRECTION> {
    list.iter()
        .map(|d| PS5000A_DIRECTION {
            channel: d.source as u32,
            direction: d.direction as u32,
            mode: d.mode as u32,
        })
        .collect()
}

fn ptr_or_null<T>(v: &mut [T]) -> *mut T {
    if v.is_empty() {
        ptr::null_mut()
    } else {
        v.as_mut_ptr()
    }
}

/// A PicoScope 5000 Series (A API) unit opened through `libps5000a`.
#[derive(Debug)]
pub struct Ps5000a {
    handle: i16,
    closed: bool,
}

impl Ps5000a {
    /// Opens the first unit found, or the one with `serial`.
    ///
    /// A power condition is not an error here: the unit is open and the
    /// status is handed back for negotiation.
    pub fn open(
        serial: Option<&str>,
        resolution: Resolution,
    ) -> Result<(Self, PicoStatus), PicoStatus> {
        let serial = serial
            .map(CString::new)
            .transpose()
            .map_err(|_| PicoStatus::InvalidParameter)?;
        let serial_ptr = serial
            .as_ref()
            .map_or(ptr::null_mut(), |s| s.as_ptr() as *mut i8);

        let mut handle = 0i16;
        let status =
            PicoStatus::from(unsafe { ps5000aOpenUnit(&mut handle, serial_ptr, resolution as u32) });
        if status != PicoStatus::Ok && !status.is_power_condition() {
            return Err(status);
        }
        if handle <= 0 {
            return Err(PicoStatus::NotFound);
        }
        Ok((
            Self {
                handle,
                closed: false,
            },
            status,
        ))
    }

    pub fn handle(&self) -> i16 {
        self.handle
    }
}

impl Drop for Ps5000a {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = PicoStatus::check(unsafe { ps5000aCloseUnit(self.handle) }) {
                warn!("Closing unit {} on drop failed: {e}", self.handle);
            }
        }
    }
}

impl Driver for Ps5000a {
    fn unit_info(&mut self, info: UnitInfo) -> Result<String, PicoStatus> {
        let mut buffer = [0i8; INFO_LEN];
        let mut required = 0i16;
        PicoStatus::check(unsafe {
            ps5000aGetUnitInfo(
                self.handle,
                buffer.as_mut_ptr(),
                INFO_LEN as i16,
                &mut required,
                info as u32,
            )
        })?;
        let bytes: Vec<u8> = buffer
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn current_power_source(&mut self) -> PicoStatus {
        PicoStatus::from(unsafe { ps5000aCurrentPowerSource(self.handle) })
    }

    fn change_power_source(&mut self, state: PicoStatus) -> PicoStatus {
        PicoStatus::from(unsafe { ps5000aChangePowerSource(self.handle, state.code()) })
    }

    fn device_resolution(&mut self) -> Result<Resolution, PicoStatus> {
        let mut code = 0u32;
        PicoStatus::check(unsafe { ps5000aGetDeviceResolution(self.handle, &mut code) })?;
        Resolution::from_code(code).ok_or(PicoStatus::InvalidDeviceResolution)
    }

    fn set_device_resolution(&mut self, resolution: Resolution) -> Result<(), PicoStatus> {
        PicoStatus::check(unsafe { ps5000aSetDeviceResolution(self.handle, resolution as u32) })
    }

    fn maximum_value(&mut self) -> Result<i16, PicoStatus> {
        let mut value = 0i16;
        PicoStatus::check(unsafe { ps5000aMaximumValue(self.handle, &mut value) })?;
        Ok(value)
    }

    fn set_channel(
        &mut self,
        channel: Channel,
        enabled: bool,
        coupling: Coupling,
        range: usize,
        analog_offset: f32,
    ) -> Result<(), PicoStatus> {
        PicoStatus::check(unsafe {
            ps5000aSetChannel(
                self.handle,
                channel as u32,
                i16::from(enabled),
                coupling as u32,
                range as u32,
                analog_offset,
            )
        })
    }

    fn set_digital_port(&mut self, port: usize, enabled: bool) -> Result<(), PicoStatus> {
        PicoStatus::check(unsafe {
            ps5000aSetDigitalPort(self.handle, DIGITAL_PORT0 + port as u32, i16::from(enabled), 0)
        })
    }

    fn minimum_timebase(
        &mut self,
        channels: ChannelFlags,
        resolution: Resolution,
    ) -> Result<(u32, f64), PicoStatus> {
        let mut timebase = 0u32;
        let mut interval = 0f64;
        PicoStatus::check(unsafe {
            ps5000aGetMinimumTimebaseStateless(
                self.handle,
                channels.0,
                &mut timebase,
                &mut interval,
                resolution as u32,
            )
        })?;
        Ok((timebase, interval))
    }

    fn timebase(
        &mut self,
        timebase: u32,
        n_samples: u32,
        segment: u32,
    ) -> Result<TimebaseInfo, PicoStatus> {
        let mut interval_ns = 0i32;
        let mut max_samples = 0i32;
        PicoStatus::check(unsafe {
            ps5000aGetTimebase(
                self.handle,
                timebase,
                n_samples.min(i32::MAX as u32) as i32,
                &mut interval_ns,
                &mut max_samples,
                segment,
            )
        })?;
        Ok(TimebaseInfo {
            timebase,
            interval_ns,
            max_samples,
        })
    }

    fn set_trigger_channel_properties(
        &mut self,
        properties: &[ChannelProperties],
    ) -> Result<(), PicoStatus> {
        let mut raw: Vec<PS5000A_TRIGGER_CHANNEL_PROPERTIES_V2> = properties
            .iter()
            .map(|p| PS5000A_TRIGGER_CHANNEL_PROPERTIES_V2 {
                thresholdUpper: p.threshold_upper,
                thresholdUpperHysteresis: p.threshold_upper_hysteresis,
                thresholdLower: p.threshold_lower,
                thresholdLowerHysteresis: p.threshold_lower_hysteresis,
                channel: p.channel as u32,
            })
            .collect();
        PicoStatus::check(unsafe {
            ps5000aSetTriggerChannelPropertiesV2(
                self.handle,
                ptr_or_null(&mut raw),
                clamp_i16(raw.len()),
                0,
            )
        })
    }

    fn set_trigger_channel_conditions(
        &mut self,
        list: &[Condition],
        info: ConditionsInfo,
    ) -> Result<(), PicoStatus> {
        let mut raw = conditions(list);
        PicoStatus::check(unsafe {
            ps5000aSetTriggerChannelConditionsV2(
                self.handle,
                ptr_or_null(&mut raw),
                clamp_i16(raw.len()),
                info as u32,
            )
        })
    }

    fn set_trigger_channel_directions(&mut self, list: &[Direction]) -> Result<(), PicoStatus> {
        let mut raw = directions(list);
        PicoStatus::check(unsafe {
            ps5000aSetTriggerChannelDirectionsV2(
                self.handle,
                ptr_or_null(&mut raw),
                raw.len().min(u16::MAX as usize) as u16,
            )
        })
    }

    fn set_auto_trigger_us(&mut self, micros: u64) -> Result<(), PicoStatus> {
        PicoStatus::check(unsafe { ps5000aSetAutoTriggerMicroSeconds(self.handle, micros) })
    }

    fn set_trigger_delay(&mut self, delay: u32) -> Result<(), PicoStatus> {
        PicoStatus::check(unsafe { ps5000aSetTriggerDelay(self.handle, delay) })
    }

    fn set_pulse_width_qualifier_conditions(
        &mut self,
        list: &[Condition],
        info: ConditionsInfo,
    ) -> Result<(), PicoStatus> {
        let mut raw = conditions(list);
        PicoStatus::check(unsafe {
            ps5000aSetPulseWidthQualifierConditions(
                self.handle,
                ptr_or_null(&mut raw),
                clamp_i16(raw.len()),
                info as u32,
            )
        })
    }

    fn set_pulse_width_qualifier_directions(
        &mut self,
        list: &[Direction],
    ) -> Result<(), PicoStatus> {
        let mut raw = directions(list);
        PicoStatus::check(unsafe {
            ps5000aSetPulseWidthQualifierDirections(
                self.handle,
                ptr_or_null(&mut raw),
                clamp_i16(raw.len()),
            )
        })
    }

    fn set_pulse_width_qualifier_properties(
        &mut self,
        lower: u32,
        upper: u32,
        kind: PulseWidthType,
    ) -> Result<(), PicoStatus> {
        PicoStatus::check(unsafe {
            ps5000aSetPulseWidthQualifierProperties(self.handle, lower, upper, kind as u32)
        })
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
        PicoStatus::check(unsafe {
            ps5000aSetSimpleTrigger(
                self.handle,
                i16::from(enabled),
                source as u32,
                threshold,
                direction as u32,
                delay,
                auto_trigger_ms,
            )
        })
    }

    unsafe fn set_data_buffers(
        &mut self,
        channel: Channel,
        segment: u32,
        buffers: Option<BufferBinding>,
    ) -> Result<(), PicoStatus> {
        let (max, min, len, mode) = match buffers {
            Some(b) => (b.max, b.min, b.len, b.mode),
            None => (ptr::null_mut(), ptr::null_mut(), 0, RatioMode::None),
        };
        let len = i32::try_from(len).map_err(|_| PicoStatus::TooManySamples)?;
        PicoStatus::check(ps5000aSetDataBuffers(
            self.handle,
            channel as u32,
            max,
            min,
            len,
            segment,
            mode as u32,
        ))
    }

    fn run_streaming(&mut self, request: &StreamingRequest) -> Result<u32, PicoStatus> {
        let mut interval = request.sample_interval;
        PicoStatus::check(unsafe {
            ps5000aRunStreaming(
                self.handle,
                &mut interval,
                request.time_units as u32,
                request.pre_trigger,
                request.post_trigger,
                i16::from(request.auto_stop),
                request.downsample_ratio,
                request.ratio_mode as u32,
                request.overview_len,
            )
        })?;
        Ok(interval)
    }

    fn streaming_latest_values(&mut self) -> Result<Option<StreamingReady>, PicoStatus> {
        let mut slot: Option<StreamingReady> = None;
        PicoStatus::check(unsafe {
            ps5000aGetStreamingLatestValues(
                self.handle,
                on_streaming_ready,
                &mut slot as *mut Option<StreamingReady> as *mut c_void,
            )
        })?;
        Ok(slot.filter(|ready| ready.n_samples > 0 || ready.auto_stop))
    }

    fn max_segments(&mut self) -> Result<u32, PicoStatus> {
        let mut max = 0u32;
        PicoStatus::check(unsafe { ps5000aGetMaxSegments(self.handle, &mut max) })?;
        Ok(max)
    }

    fn memory_segments(&mut self, n_segments: u32) -> Result<i32, PicoStatus> {
        let mut max_samples = 0i32;
        PicoStatus::check(unsafe {
            ps5000aMemorySegments(self.handle, n_segments, &mut max_samples)
        })?;
        Ok(max_samples)
    }

    fn set_no_of_captures(&mut self, n_captures: u32) -> Result<(), PicoStatus> {
        PicoStatus::check(unsafe { ps5000aSetNoOfCaptures(self.handle, n_captures) })
    }

    fn run_block(
        &mut self,
        pre_trigger: u32,
        post_trigger: u32,
        timebase: u32,
        segment: u32,
    ) -> Result<i32, PicoStatus> {
        let mut indisposed_ms = 0i32;
        PicoStatus::check(unsafe {
            ps5000aRunBlock(
                self.handle,
                pre_trigger.min(i32::MAX as u32) as i32,
                post_trigger.min(i32::MAX as u32) as i32,
                timebase,
                &mut indisposed_ms,
                segment,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        })?;
        Ok(indisposed_ms)
    }

    fn is_ready(&mut self) -> Result<bool, PicoStatus> {
        let mut ready = 0i16;
        PicoStatus::check(unsafe { ps5000aIsReady(self.handle, &mut ready) })?;
        Ok(ready != 0)
    }

    fn no_of_captures(&mut self) -> Result<u32, PicoStatus> {
        let mut n = 0u32;
        PicoStatus::check(unsafe { ps5000aGetNoOfCaptures(self.handle, &mut n) })?;
        Ok(n)
    }

    fn values_bulk(
        &mut self,
        n_samples: u32,
        from: u32,
        to: u32,
        downsample_ratio: u32,
        mode: RatioMode,
        overflow: &mut [i16],
    ) -> Result<u32, PicoStatus> {
        let segments = to.saturating_sub(from) as usize + 1;
        if overflow.len() < segments {
            return Err(PicoStatus::NullParameter);
        }
        let mut n = n_samples;
        PicoStatus::check(unsafe {
            ps5000aGetValuesBulk(
                self.handle,
                &mut n,
                from,
                to,
                downsample_ratio,
                mode as u32,
                overflow.as_mut_ptr(),
            )
        })?;
        Ok(n)
    }

    fn trigger_info_bulk(
        &mut self,
        info: &mut [TriggerInfo],
        from: u32,
        to: u32,
    ) -> Result<(), PicoStatus> {
        let segments = to.saturating_sub(from) as usize + 1;
        if info.len() < segments {
            return Err(PicoStatus::NullParameter);
        }
        let mut raw = vec![PS5000A_TRIGGER_INFO::default(); segments];
        PicoStatus::check(unsafe {
            ps5000aGetTriggerInfoBulk(self.handle, raw.as_mut_ptr(), from, to)
        })?;
        for (out, r) in info.iter_mut().zip(raw) {
            *out = TriggerInfo {
                status: PicoStatus::from(r.status),
                segment_index: r.segmentIndex,
                trigger_index: r.triggerIndex,
                trigger_time: r.triggerTime,
                time_units: TimeUnits::from_code(r.timeUnits as u32),
                timestamp_counter: r.timeStampCounter,
            };
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PicoStatus> {
        PicoStatus::check(unsafe { ps5000aStop(self.handle) })
    }

    fn close(&mut self) -> Result<(), PicoStatus> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        PicoStatus::check(unsafe { ps5000aCloseUnit(self.handle) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn struct_layouts_match_the_c_header() {
        assert_eq!(size_of::<PS5000A_TRIGGER_INFO>(), 32);
        assert_eq!(size_of::<PS5000A_DIRECTION>(), 12);
    }
}
