#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

// --- Global Imports
pub(crate) use std::collections::{HashMap, HashSet, VecDeque};
pub(crate) use std::sync::Arc;
pub(crate) use log::{debug, info, warn};
pub(crate) use parking_lot::{Condvar, Mutex};
pub(crate) use downcast_rs::Downcast;

// --- Public Prelude
/// API Prelude
pub mod prelude {
    pub use std::sync::Arc;
    pub use crate::ctx::Ctx;
    pub use crate::error::{Fault, SpawnError};
    pub use crate::event::{Channel, Event, EventId, Notice, Payload, TimeBudget};
    pub use crate::handler::{Handler, HandlerId, Outcome};
    pub use crate::manager::{ComponentId, Manager};
    pub use crate::runloop::{Emitter, Spawn, Spawned};
    pub use crate::task::{call, wait, CallFlow, Flow, Step, WaitFlow};
    pub use crate::value::{Settled, Value};
}

// --- Re-exports of used libraries.
pub use log;
pub use futures;
pub use downcast_rs;
pub use parking_lot;

// --- Modules
pub mod ctx;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod handler;
pub mod manager;
pub mod runloop;
pub mod task;
pub mod value;

// --- Internal Prelude
pub(crate) use ctx::*;
pub(crate) use error::*;
pub(crate) use event::*;
pub(crate) use handler::*;
pub(crate) use manager::*;
pub(crate) use task::*;
pub(crate) use value::*;
