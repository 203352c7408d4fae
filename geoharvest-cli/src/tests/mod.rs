//! Shared test harness modules for the geoharvest CLI.
#![expect(
    clippy::panic,
    reason = "Tests assert panic branches to surface unexpected CLI outcomes"
)]

use super::*;

mod command_unit;
mod helpers;
mod incremental_steps;
