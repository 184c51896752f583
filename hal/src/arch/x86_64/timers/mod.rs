//! # Timing Sources
//!
//! The PIT is kept only as the independent reference for calibrating the
//! APIC timer and the TSC; once calibration is done all timing runs off
//! the calibrated sources.

pub mod pit;
pub mod tsc;

pub use tsc::{delay_us, read_tsc, set_tsc_frequency, tsc_frequency};
