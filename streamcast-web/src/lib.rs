//! Streamcast Web - HTTP API surface
//!
//! JSON endpoints for loading preset stream groups, polling cached playback
//! URLs, and submitting background processing jobs. Long-running work never
//! blocks a handler; submissions return immediately and are polled via the
//! status endpoint.

pub mod handlers;
pub mod presets;
pub mod server;

pub use presets::{PresetFeed, PresetLibrary};
pub use server::{AppState, cleanup_sessions, router, run_server};
