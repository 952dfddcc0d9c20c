#![allow(clippy::new_without_default)]

//! Ambient infrastructure shared by every `vbiproxyd` crate: structured logging and
//! small time helpers. Nothing in here is specific to VBI or to the wire protocol.

pub mod logging;
pub mod time;

pub use slog;
