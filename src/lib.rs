//! Core of a tracing producer daemon.
//!
//! Owns a catalogue of data sources (ftrace, process stats, inode maps,
//! power, system counters), registers them with a central tracing service
//! and, on request, instantiates, starts, flushes and stops per-session
//! instances that write trace packets into shared-memory buffers. A
//! self-protection watchdog samples the daemon's own CPU and memory usage
//! and aborts the process when configured limits are exceeded.
//!
//! The IPC transport, the shared-memory mechanics and the executable entry
//! point live outside this crate; see [`service`] and [`runner`] for the
//! contracts they implement.

pub mod config;
pub mod producer;
pub mod runner;
pub mod service;
pub mod source;
pub mod watchdog;
