//! External tool instances
//!
//! The engine only talks to steamcmd through the [`InstanceRunner`] trait:
//! spawn one process for one chunk, capture its output to a log, and report
//! whether it exited on its own or had to be killed.
//!
//! - [`CliInstanceRunner`]: launches the real `steamcmd` binary
//! - [`script`]: renders and writes the per-instance command script

mod cli;
#[cfg(test)]
pub(crate) mod fake;
pub mod script;
mod traits;

pub use cli::CliInstanceRunner;
pub use traits::{InstanceRun, InstanceRunner, Invocation, ProcessExit};
