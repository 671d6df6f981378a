//! Host-side render pipeline for compiled declarative UI applications.
//!
//! A render session drives one runtime instance per request and resolves its
//! backend jobs. The build orchestrator and the dev pool run sessions on
//! dedicated render threads, and the patcher teaches the client virtual-DOM
//! engine to adopt the frozen regions a build extracts.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub(crate) mod util;

pub use frostline_protocol as protocol;
