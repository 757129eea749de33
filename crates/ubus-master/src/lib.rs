//! ubus-master — the discovery broker.
//!
//! Participants join over the control port, advertise events and methods,
//! and ask where others' events and methods live. Payloads never pass
//! through here; only connection details do.

pub mod accept;
pub mod control_loop;
pub mod debug;
pub mod dispatch;
pub mod master;
pub mod registry;
pub mod watchdog;

pub use master::Master;
pub use registry::Registry;
