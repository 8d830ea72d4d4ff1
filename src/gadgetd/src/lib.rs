//! gadgetd: runs the gadget reconciler as a device daemon.

pub mod daemon;

pub use daemon::{run, run_with, shutdown_signal, Components, DaemonError, Overrides};
