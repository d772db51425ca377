//! Actor-based processing pipeline
//!
//! Listeners feed raw readings into the updater, which routes them to
//! per-system workers. Workers publish metric, status, and alarm events
//! on a broadcast bus; the hub fans the bus out to connected viewers.
//! The siren synchronizer, offline detector, and downsampler run beside
//! the pipeline against the same storage backend.

pub mod downsampler;
pub mod hub;
pub mod messages;
pub mod offline;
pub mod siren;
pub mod updater;

pub use downsampler::DownsamplerHandle;
pub use hub::HubHandle;
pub use messages::{Envelope, EventType, RawReading};
pub use offline::OfflineHandle;
pub use siren::SirenHandle;
pub use updater::UpdaterHandle;
