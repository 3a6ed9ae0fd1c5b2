#![forbid(unsafe_code)]

//! Thermostat demo for the dm model point layer.
//!
//! A sensor thread publishes temperature samples; a control event loop turns
//! them into an HVAC mode; a journal event loop records every change as
//! JSONL. See [`app`] for the thread layout.

pub mod app;
pub mod cli;
pub mod model;
