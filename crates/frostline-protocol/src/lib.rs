//! Shared wire types for the frostline host and compiled UI runtimes.
//!
//! Everything in this crate crosses a process or network boundary: the
//! newline-delimited JSON messages exchanged with a runtime instance, the
//! normalized job responses delivered back into it, the render outcomes handed
//! to adapters, and the binary content frame served per route.

pub mod diagnostics;
pub mod frame;
pub mod jobs;
pub mod messages;
pub mod outcome;
mod serde_base64;

pub use diagnostics::{BuildError, Color, MessagePart};
pub use frame::{ContentFrame, FrameError, RegionMap};
pub use jobs::{InternalJob, JobError, JobErrorTag, JobKind, JobResponse, JobResult, PendingJob};
pub use messages::{COMPATIBILITY_KEY, FromRuntime, InitPayload, RenderMode, ToRuntime};
pub use outcome::{
    ApiResponse, ApiResponseKind, BytesPage, HtmlPage, PageProgress, RenderOutcome,
    RequestBody, RequestPayload, SurfacedOutcome,
};
