//! Reconnecting duplex transport to the voice backend.

pub mod link;
pub mod policy;
pub mod probe;

pub use link::{LinkEvent, Transport};
pub use policy::ReconnectPolicy;
pub use probe::{CapabilityProbe, HttpCapabilityProbe, ProbeOutcome, StaticProbe};
