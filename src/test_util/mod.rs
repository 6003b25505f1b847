//! Utilities for testing code that uses this crate: a simulated device that records the calls it
//!  receives, a socket that records datagrams instead of sending them, and frame builders. They
//!  are part of the regular (non-#[cfg(test)]) code so that integration tests and applications
//!  can use them as well.

pub mod device;
pub mod frame;
pub mod socket;
