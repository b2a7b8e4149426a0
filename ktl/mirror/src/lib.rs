//! Mirror Bus: session-scoped pub/sub fabric for streamed deploy progress,
//! and the adapter that feeds it from the Stack Runner's event stream
//! (`spec.md` §4.4).

pub mod adapter;
pub mod error;
pub mod hub;

pub use adapter::DeployEventAdapter;
pub use error::MirrorError;
pub use hub::{MirrorHub, ReplaySnapshot};
