//! Host-facing contract and the stdio bridge for native app integration.

pub mod contract;
pub mod stdio;
