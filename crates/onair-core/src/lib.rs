//! Now-playing sync, play-history logging and live stream playback.
//!
//! Data flows one way: [`poller`] fetches the upstream feed through
//! [`upstream`], [`track`] normalizes it, [`logger`] persists deduplicated
//! plays into a [`store`], and [`resolver`] publishes the freshest snapshot
//! to readers. [`playback`] is independent and only consumes now-playing
//! metadata for the media session.

pub mod config;
pub mod error;
pub mod history;
pub mod logger;
pub mod platform;
pub mod playback;
pub mod poller;
pub mod protocol;
pub mod resolver;
pub mod snapshot;
pub mod store;
pub mod timezone;
pub mod track;
pub mod upstream;

pub use error::{Error, Result};
