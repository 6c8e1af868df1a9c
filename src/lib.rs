//! # OBD Collector Library
//!
//! Record vehicle diagnostics and GPS fixes into trip files, then ship them to
//! an object store.
//!
//! This library provides the acquisition pipeline (ELM327 adapter, gpsd
//! reader, trip file writer), the background sync agent, and the command
//! surface used to control a running collector.

pub mod catalog;
pub mod command;
pub mod config;
pub mod error;
pub mod obd;
pub mod orchestrator;
pub mod positioning;
pub mod serial;
pub mod session;
pub mod sync;
pub mod telemetry;
