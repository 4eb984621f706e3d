//! Zombie detection and operator control.
//!
//! A zombie is a run that is still `running` but no longer making progress:
//! silent, stagnant, burning tokens without output, or looping. The detector
//! flags and escalates; [`ZombieControl`] performs kills and pardons.

pub mod control;
pub mod detector;
pub mod heuristics;

pub use control::{ControlOutcome, SessionTerminator, ZombieControl, ZombieSummary};
pub use detector::{ScanReport, ZombieDetector, spawn_zombie_detector};
pub use heuristics::{RunObservation, Signals, Verdict};
