//! MAC-layer frame engine for a LoRaWAN 1.0-class network server.
//!
//! This crate owns frame parsing, MIC verification, payload encryption,
//! frame-counter policing, DevAddr allocation, and join/downlink frame
//! construction. It does not own gateway transport or persistence: those
//! are the [`store::Store`] trait and the `gateway` module's job.

pub mod codec;
pub mod config;
pub mod counter;
pub mod crypto;
pub mod downlink;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod join;
pub mod region;
pub mod store;
pub mod warnings;
