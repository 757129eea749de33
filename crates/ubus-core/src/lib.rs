//! ubus-core — shared wire format, control documents, and message codecs.
//! The master, the runtime library, and the CLI all depend on this one.

pub mod config;
pub mod control;
pub mod error;
pub mod message;
pub mod poll;
pub mod wire;

pub use control::{ControlDoc, ResponseCode};
pub use error::BusError;
pub use message::Message;
pub use wire::{Frame, FrameType};
