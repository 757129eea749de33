//! ubus-runtime — the participant library.
//!
//! A [`Runtime`] joins the bus through the master, then publishes and
//! subscribes to events and provides and calls methods. Event and method
//! payloads travel directly between runtimes; the master only tells each
//! side where the other listens.
//!
//! ```no_run
//! use ubus_core::message::StringMsg;
//! use ubus_runtime::Runtime;
//!
//! # async fn demo() -> Result<(), ubus_core::BusError> {
//! let rt = Runtime::default();
//! rt.init("sensor", "127.0.0.1", 5101).await?;
//! rt.advertise_event::<StringMsg>("readings").await?;
//! rt.publish_event("readings", &StringMsg::from("21.5")).await?;
//! # Ok(())
//! # }
//! ```

pub mod callback;
mod control;
mod debug;
mod event_loop;
mod keep_alive;
mod peer_server;
mod runtime;
mod state;

pub use callback::{EventHandler, MethodHandler};
pub use runtime::Runtime;
pub use ubus_core::error::BusError;
pub use ubus_core::message::Message;
