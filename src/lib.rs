//! This crate provides the analog control core of a programmable bench power supply.
//!
//! It runs on the supply's own microcontroller and is driven by a 1 ms tick. Every tick it samples
//! the voltage and current ADCs, enforces the OVP/OCP/OPP/OTP protections, classifies the output as
//! constant voltage or constant current, runs the fan, and counts down the auto-off timer.
//!
//! The hardware is reached through the small traits in [`interface`], and persistent parameters
//! through [`params::ParamStore`], so the whole core can be exercised on a host.
//!
//! It is `no_std` unless the `std` feature is enabled. Logging goes to `log` by default, or to
//! `defmt` with default features off and the `defmt` feature on.
//!
//! Units used throughout:
//! * Voltage: 0.01 V
//! * Current: 0.001 A
//! * Power: 0.1 W
//! * Temperature: 0.1 °C
//! * Time: 1 ms ticks

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod fmt;

pub mod analog;
pub mod calibration;
pub mod error;
pub mod interface;
pub mod measure;
pub mod output;
pub mod params;
pub mod protection;
pub mod regulation;
pub mod scaling;
pub mod supervisor;
pub mod thermal;
pub mod timer;
pub mod types;

#[cfg(test)]
mod mock;
