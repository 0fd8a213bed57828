//! Core types and data models for the event-relay sink
//!
//! This crate provides the fundamental data structures shared between the
//! collector front-end and the sink pipeline.

pub mod events;

pub use events::{EventBatch, RawEvent};
