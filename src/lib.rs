//! Telescope multiplexer: walks per-stream capture rings, packs kept
//! records into bounded multicast datagrams, and beacons the publisher so
//! downstream consumers can find every active stream.
//!
//! Module layout mirrors the component design: [`ring`] is the capture-ring
//! adapter, [`record`] the framing/walker, [`filter`] the darknet predicate,
//! [`publish`] the wire encoder and socket owner, [`orchestrator`] the
//! worker lifecycle, [`stats`]/[`control`]/[`config`]/[`mqueue`] the ambient
//! stack around them.

#![allow(non_local_definitions)] // failure_derive predates this lint

#[macro_use]
extern crate failure_derive;

pub mod config;
pub mod control;
pub mod error;
pub mod filter;
pub mod mqueue;
pub mod orchestrator;
pub mod publish;
pub mod record;
pub mod ring;
pub mod stats;

pub use error::{Error, Result};
