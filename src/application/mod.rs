//! Render pipeline services: sessions, job resolution, build and dev pools.

pub mod build;
pub mod dev;
pub mod error;
pub mod frozen;
pub mod jobs;
pub mod patch;
pub mod render;
pub mod worker;
