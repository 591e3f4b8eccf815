//! Control stack for a Linux brick whose motors and sensors are exposed as
//! sysfs attribute files.
//!
//! # Architecture
//!
//! ```text
//! gamepad ──► router ──► setpoint cells ─┐
//!                                        ├──► control loops ──► motor attributes
//! motor / sensor attributes ─────────────┘
//!            │
//!            └──► stream server ──► TCP clients
//! ```
//!
//! 1. [`attribute`] - devices, property tables and attribute handles
//! 2. [`pid`] - proportional-derivative controller
//! 3. [`control`] - fixed-frequency loops with single-writer actuators
//! 4. [`stream`] - TCP server streaming attribute samples
//! 5. [`gamepad`] and [`signal`] - axis input and transform chains
//! 6. [`config`] and [`app`] - TOML configuration and process assembly

pub mod app;
pub mod attribute;
pub mod config;
pub mod control;
pub mod gamepad;
pub mod pid;
pub mod signal;
pub mod stream;
