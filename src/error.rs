use crate::{Channel, PicoStatus, Resolution};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcqError {
    #[error("{step} failed: {status}")]
    Driver {
        step: &'static str,
        status: PicoStatus,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("power negotiation did not settle after {0} transitions")]
    PowerNegotiationExhausted(usize),
    #[error("power source changed during {step}: {status}")]
    PowerInterrupted {
        step: &'static str,
        status: PicoStatus,
    },
    #[error("driver reported samples {start}..{} beyond a buffer of {capacity}", .start + .count)]
    Overrun {
        start: usize,
        count: usize,
        capacity: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Rejected before any device call is issued.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("range index {range} for channel {channel} is outside {first}..={last}")]
    RangeOutOfBounds {
        channel: Channel,
        range: usize,
        first: usize,
        last: usize,
    },
    #[error("channel {0} is not available on this unit")]
    NoSuchChannel(Channel),
    #[error("at least one channel must be enabled")]
    NoChannelEnabled,
    #[error("{resolution} allows at most {max} enabled channel(s), {enabled} enabled")]
    TooManyChannels {
        resolution: Resolution,
        enabled: usize,
        max: usize,
    },
    #[error("channel {0} is not enabled")]
    ChannelDisabled(Channel),
    #[error("pre-trigger ({pre}) + post-trigger ({post}) must equal {samples} samples")]
    TriggerSplit { pre: u32, post: u32, samples: u32 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("unknown resolution of {0} bits")]
    UnknownResolution(u8),
}

/// Tags a driver status with the step that produced it.
pub trait StepContext<T> {
    fn at(self, step: &'static str) -> Result<T, AcqError>;
}

impl<T> StepContext<T> for Result<T, PicoStatus> {
    fn at(self, step: &'static str) -> Result<T, AcqError> {
        self.map_err(|status| {
            log::error!("{step} ------ {status}");
            AcqError::Driver { step, status }
        })
    }
}

impl AcqError {
    /// Driver status behind this error, if it came from a driver call.
    pub fn status(&self) -> Option<PicoStatus> {
        match self {
            AcqError::Driver { status, .. } | AcqError::PowerInterrupted { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}
