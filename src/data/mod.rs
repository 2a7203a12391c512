//! Measurement data storage and curve fitting.
pub mod fit;
pub mod storage;

pub use fit::{fit_saturation, SaturationFit};
pub use storage::{format_sci, save_table, TsvWriter};
