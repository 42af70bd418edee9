//! Distributed build: wire protocol, exec helper, worker and controller.
//!
//! Four actors: the *initiator* (the user's CLI) talks to a *controller*
//! daemon, which owns connections to *worker* daemons, each of which
//! supervises subprocesses through the exec *helper*. Frames are one JSON
//! object per line over TCP.

pub mod controller;
pub mod error;
pub mod helper;
pub mod initiator;
pub mod protocol;
pub mod worker;

pub use controller::{ClaimStatus, ClaimTable, ControllerDaemon, WorkerPool};
pub use error::{DistbuildError, DistbuildResult};
pub use helper::{ExecControl, RunningExec};
pub use initiator::InitiatorClient;
pub use protocol::{Message, StreamKind, read_message, write_message};
pub use worker::WorkerDaemon;
