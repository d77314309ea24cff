use crate::{AcqError, BufferBinding, Channel, ConfigError, Driver, RatioMode, StepContext, UnitModel};
use log::{debug, warn};
use std::collections::BTreeMap;

/// The four buffers kept for one enabled channel.
#[derive(Debug)]
struct ChannelBuffers {
    driver_max: Vec<i16>,
    driver_min: Vec<i16>,
    app_max: Vec<i16>,
    app_min: Vec<i16>,
}

impl ChannelBuffers {
    fn new(capacity: usize) -> Self {
        Self {
            driver_max: vec![0; capacity],
            driver_min: vec![0; capacity],
            app_max: vec![0; capacity],
            app_min: vec![0; capacity],
        }
    }
}

/// Double buffer between the driver's overview writes and the application.
///
/// The driver-side halves are handed to the device by [`bind_to_device`]
/// and written behind our back during each poll; [`on_samples_ready`]
/// copies the freshly reported range into the application-side halves.
/// Disabled channels own no memory at all.
///
/// [`bind_to_device`]: BufferPool::bind_to_device
/// [`on_samples_ready`]: BufferPool::on_samples_ready
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    buffers: BTreeMap<Channel, Option<ChannelBuffers>>,
    bound: Vec<Channel>,
}

impl BufferPool {
    pub fn allocate(unit: &UnitModel, capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::Zero("buffer capacity"));
        }
        let buffers = unit
            .channels()
            .iter()
            .map(|(&ch, s)| (ch, s.enabled.then(|| ChannelBuffers::new(capacity))))
            .collect();
        Ok(Self {
            capacity,
            buffers,
            bound: Vec::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Channels that have buffers.
    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.buffers
            .iter()
            .filter(|(_, b)| b.is_some())
            .map(|(&ch, _)| ch)
    }

    pub fn is_bound(&self) -> bool {
        !self.bound.is_empty()
    }

    pub fn app_max(&self, channel: Channel) -> Option<&[i16]> {
        self.buffers
            .get(&channel)?
            .as_ref()
            .map(|b| b.app_max.as_slice())
    }

    pub fn app_min(&self, channel: Channel) -> Option<&[i16]> {
        self.buffers
            .get(&channel)?
            .as_ref()
            .map(|b| b.app_min.as_slice())
    }

    /// Registers every driver-side buffer with segment 0 of the device.
    ///
    /// On failure the channels bound so far stay bound; call [`release`]
    /// to undo them.
    ///
    /// [`release`]: BufferPool::release
    pub fn bind_to_device<D: Driver>(
        &mut self,
        driver: &mut D,
        mode: RatioMode,
    ) -> Result<(), AcqError> {
        for (&channel, slot) in self.buffers.iter_mut() {
            let Some(buffers) = slot else { continue };
            if self.bound.contains(&channel) {
                continue;
            }
            let binding = BufferBinding {
                max: buffers.driver_max.as_mut_ptr(),
                min: buffers.driver_min.as_mut_ptr(),
                len: self.capacity,
                mode,
            };
            // SAFETY: the vectors are never resized, and `release` (or the
            // leak in `Drop`) keeps them alive until the binding is cleared.
            unsafe { driver.set_data_buffers(channel, 0, Some(binding)) }
                .at("set data buffers")?;
            self.bound.push(channel);
        }
        debug!("Bound {} channel buffer pair(s)", self.bound.len());
        Ok(())
    }

    /// Copies `[start, start + count)` of every bound channel's max and min
    /// buffer to the application side. Nothing outside the range is touched.
    pub fn on_samples_ready(&mut self, start: usize, count: usize) -> Result<(), AcqError> {
        let end = start
            .checked_add(count)
            .filter(|&end| end <= self.capacity)
            .ok_or(AcqError::Overrun {
                start,
                count,
                capacity: self.capacity,
            })?;
        for channel in &self.bound {
            let Some(Some(b)) = self.buffers.get_mut(channel) else {
                continue;
            };
            b.app_max[start..end].copy_from_slice(&b.driver_max[start..end]);
            b.app_min[start..end].copy_from_slice(&b.driver_min[start..end]);
        }
        Ok(())
    }

    /// Clears every driver binding, then frees the memory.
    ///
    /// All bindings are attempted even if one fails. Buffers whose binding
    /// could not be cleared are leaked rather than freed.
    pub fn release<D: Driver>(mut self, driver: &mut D) -> Result<(), AcqError> {
        let mut first_err = None;
        for channel in std::mem::take(&mut self.bound) {
            if let Err(e) = driver.clear_data_buffers(channel, 0).at("clear data buffers") {
                if let Some(Some(buffers)) = self.buffers.remove(&channel) {
                    warn!("Leaking buffers of channel {channel}, the driver may still write to them");
                    std::mem::forget(buffers);
                }
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if self.bound.is_empty() {
            return;
        }
        warn!(
            "Buffer pool dropped with {} channel(s) still bound, leaking them",
            self.bound.len()
        );
        for channel in std::mem::take(&mut self.bound) {
            if let Some(Some(buffers)) = self.buffers.remove(&channel) {
                std::mem::forget(buffers);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        PicoStatus, Resolution, SimConfig, SimulatedScope, StreamingRequest, TimeUnits,
    };

    fn unit() -> UnitModel {
        let mut unit = UnitModel::new("5444D", "GO123/456", 4, Resolution::Bits8, 32512);
        unit.set_enabled(Channel::C, false);
        unit
    }

    fn streaming_sim(chunk_len: u32) -> SimulatedScope {
        let mut sim = SimulatedScope::new(SimConfig {
            chunk_len,
            ..SimConfig::default()
        });
        for ch in Channel::ANALOG {
            sim.set_channel(ch, ch != Channel::C, crate::Coupling::Ac, 8, 0.0)
                .unwrap();
        }
        sim
    }

    fn request(overview_len: u32) -> StreamingRequest {
        StreamingRequest {
            sample_interval: 1,
            time_units: TimeUnits::Us,
            pre_trigger: 0,
            post_trigger: 1000,
            auto_stop: true,
            downsample_ratio: 1,
            ratio_mode: RatioMode::Aggregate,
            overview_len,
        }
    }

    #[test]
    fn disabled_channels_get_no_memory() {
        let pool = BufferPool::allocate(&unit(), 64).unwrap();
        assert_eq!(
            pool.channels().collect::<Vec<_>>(),
            vec![Channel::A, Channel::B, Channel::D]
        );
        assert!(pool.app_max(Channel::C).is_none());
        assert_eq!(pool.app_min(Channel::A).map(<[i16]>::len), Some(64));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            BufferPool::allocate(&unit(), 0).unwrap_err(),
            ConfigError::Zero("buffer capacity")
        );
    }

    #[test]
    fn copies_exactly_the_reported_range() {
        let mut sim = streaming_sim(100);
        let mut pool = BufferPool::allocate(&unit(), 1000).unwrap();
        pool.bind_to_device(&mut sim, RatioMode::Aggregate).unwrap();
        sim.run_streaming(&request(1000)).unwrap();
        let ready = sim.streaming_latest_values().unwrap().unwrap();
        assert_eq!((ready.start_index, ready.n_samples), (0, 100));

        pool.on_samples_ready(10, 50).unwrap();

        for ch in [Channel::A, Channel::B, Channel::D] {
            let b = pool.buffers[&ch].as_ref().unwrap();
            assert_eq!(b.app_max[10..60], b.driver_max[10..60]);
            assert_eq!(b.app_min[10..60], b.driver_min[10..60]);
            assert!(b.app_max[..10].iter().all(|&v| v == 0));
            assert!(b.app_max[60..].iter().all(|&v| v == 0));
            assert!(b.app_min[60..].iter().all(|&v| v == 0));
        }
        assert!(pool.buffers[&Channel::C].is_none());
        pool.release(&mut sim).unwrap();
    }

    #[test]
    fn unbound_pool_copies_nothing() {
        let mut pool = BufferPool::allocate(&unit(), 16).unwrap();
        if let Some(Some(b)) = pool.buffers.get_mut(&Channel::A) {
            b.driver_max.fill(7);
        }
        pool.on_samples_ready(0, 16).unwrap();
        assert!(pool.app_max(Channel::A).unwrap().iter().all(|&v| v == 0));
    }

    #[test]
    fn range_past_capacity_is_an_overrun() {
        let mut pool = BufferPool::allocate(&unit(), 16).unwrap();
        assert!(matches!(
            pool.on_samples_ready(10, 7),
            Err(AcqError::Overrun {
                start: 10,
                count: 7,
                capacity: 16
            })
        ));
        assert!(pool.on_samples_ready(10, 6).is_ok());
    }

    #[test]
    fn release_unbinds_every_channel() {
        let mut sim = streaming_sim(100);
        let mut pool = BufferPool::allocate(&unit(), 128).unwrap();
        pool.bind_to_device(&mut sim, RatioMode::None).unwrap();
        assert_eq!(sim.live_bindings(), 3);
        assert!(pool.is_bound());

        pool.release(&mut sim).unwrap();
        assert_eq!(sim.live_bindings(), 0);
    }

    #[test]
    fn release_keeps_going_after_a_failed_unbind() {
        let mut sim = streaming_sim(100);
        let mut pool = BufferPool::allocate(&unit(), 128).unwrap();
        pool.bind_to_device(&mut sim, RatioMode::None).unwrap();
        sim.fail_next("set_data_buffers", PicoStatus::InvalidHandle);

        let err = pool.release(&mut sim).unwrap_err();
        assert_eq!(err.status(), Some(PicoStatus::InvalidHandle));
        assert_eq!(sim.live_bindings(), 1);
    }
}
