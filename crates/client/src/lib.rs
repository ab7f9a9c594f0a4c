//! Kheti chat client.
//!
//! Coordinates one chat view: resolving session identity from route
//! events, loading transcripts, forking foreign public sessions before
//! the first write, and dispatching messages (typed or transcribed)
//! with a single request in flight at a time.
//!
//! The core logic lives in [`transition`] as a pure state machine; the
//! [`controller`] actor owns the state, executes effects against a
//! [`backend::ChatBackend`], and publishes snapshots.

pub mod audio;
pub mod auth;
pub mod backend;
pub mod config;
pub mod controller;
pub mod logging;
pub mod transition;

pub use controller::{ChatHandle, Command, UiEvent};
pub use transition::{transition, Effect, Input, Phase, ViewState};
