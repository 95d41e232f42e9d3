//! Participant setup and peer communication
//!
//! - [`env`]: launcher detection from an environment snapshot
//! - [`context`]: participant descriptor and the explicit cluster context
//! - [`comm`]: the communicator trait every exchange goes through
//! - [`fabric`]: in-process communicator over channels
//! - [`comm_utils`]: tensor send/recv/broadcast helpers
//! - [`watchdog`]: bounded waits around blocking calls
//! - [`launcher`]: one thread per rank over a local fabric

pub mod comm;
pub mod comm_utils;
pub mod context;
pub mod env;
pub mod fabric;
pub mod launcher;
pub mod watchdog;

pub use comm::{CancelToken, Communicator, Tag};
pub use context::{Backend, ClusterContext, Exchange, ParticipantDescriptor};
pub use env::{EnvSnapshot, LaunchInfo, Launcher};
pub use fabric::{LocalEndpoint, LocalFabric};
pub use launcher::LocalLauncher;
pub use watchdog::{run_bounded, WatchdogOutcome};
