//! Supervised prompt automation.
//!
//! A [`controller::AutomationController`] walks a queue of prompts through
//! timed phases on a worker thread, driving an external application through
//! an [`actions::ActionDriver`]. Runs are pausable, cancellable and checked
//! against a snapshot of their inputs, and a [`watchdog::Watchdog`] repairs
//! inconsistent state from its own thread.

pub mod actions;
pub mod cli;
pub mod config;
pub mod controller;
pub mod countdown;
pub mod error;
pub mod log;
pub mod progress;
pub mod session;
pub mod snapshot;
pub mod watchdog;
