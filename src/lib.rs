//! Acquisition layer for PicoScope 5000 Series oscilloscopes: device
//! setup, power negotiation, streaming and rapid-block capture on top of
//! an abstract [`Driver`].

pub mod buffer;
pub mod cancel;
pub mod config;
pub mod counter;
pub mod device_info;
pub mod driver;
pub mod error;
pub mod power;
#[cfg(feature = "ps5000a")]
pub mod ps5000a;
pub mod rapid_block;
pub mod scope;
pub mod sim;
pub mod status;
pub mod streaming;
pub mod trigger;
pub mod tui;
pub mod unit;
pub mod writer;

pub use buffer::*;
pub use cancel::*;
pub use config::*;
pub use counter::*;
pub use device_info::*;
pub use driver::*;
pub use error::*;
pub use power::*;
#[cfg(feature = "ps5000a")]
pub use ps5000a::*;
pub use rapid_block::*;
pub use scope::*;
pub use sim::*;
pub use status::*;
pub use streaming::*;
pub use trigger::*;
pub use tui::*;
pub use unit::*;
pub use writer::*;
