//! Winlogon manager daemon.
//!
//! One process per host owns the command channel (decided by [`instance`]).
//! Later invocations forward their command to it over the channel and relay
//! the reply; the owner executes commands through the [`dispatcher`].

pub mod app;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod logging;
pub mod notify;
pub mod process;
pub mod service;

pub use channel::{ChannelServer, CommandHandler, CommandOutcome};
pub use error::{ErrorCode, WlmError, WlmResult};
pub use lifecycle::{LifecycleCoordinator, LifecycleState, StopHandle, TransitionError};
