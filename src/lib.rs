//! Headless player for music stored on ESPWiFi devices.
//!
//! Tracks are listed over the device's HTTP file API and streamed over its
//! media WebSocket in pull-based chunks. Each chunk is either appended to a
//! decoder that is already playing, or collected until the whole file has
//! arrived, depending on what the audio output can handle for the track's
//! format.
//!
//! # Layout
//!
//! * [`player`]: the engine, free of I/O, driven by events
//! * [`stream`], [`pipeline`], [`seek`], [`state`]: the state machines the
//!   engine is built from
//! * [`remote`] and [`output`]: the WebSocket transport and the rodio audio
//!   sink that connect the engine to the outside world
//! * [`gateway`]: track listings
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
extern crate log;

pub mod buffer;
pub mod config;
pub mod decoder;
pub mod error;
pub mod events;
pub mod gateway;
pub mod output;
pub mod pipeline;
pub mod player;
pub mod protocol;
pub mod reaper;
pub mod remote;
pub mod seek;
pub mod sequencer;
pub mod session;
pub mod signal;
pub mod sink;
pub mod state;
pub mod stream;
pub mod track;
pub mod transport;

#[cfg(test)]
pub mod testing;
