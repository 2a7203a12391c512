//! # DAQ Modules
//!
//! Instrument drivers and measurement logic for a scanning-probe and
//! confocal NV setup, usable headless from the `daq-modules` binary or
//! embedded in another frontend.
//!
//! ## Crate Structure
//!
//! - **`config`**: TOML + environment configuration loaded with `figment`.
//!   Lists the `[[hardware]]` and `[[logic]]` modules and how they connect.
//! - **`error`**: The `DaqError` enum shared by drivers and logic.
//! - **`module`**: The `Module` lifecycle trait (activate, deactivate, state).
//! - **`hardware`**: Capability traits, the line-oriented transport, the
//!   instrument drivers, in-process simulators and the `ModuleRegistry`.
//! - **`logic`**: Measurement procedures over the capability traits (PID and
//!   level sensor monitoring, laser saturation curves, area scans,
//!   positioning).
//! - **`data`**: Tab-separated measurement files with a commented header, and
//!   the saturation curve fit.
//! - **`tracing_setup`**: Structured logging initialisation.

pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logic;
pub mod module;
pub mod tracing_setup;
