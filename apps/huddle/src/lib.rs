pub mod config;
pub mod manager;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;
