//! The [`WirePayload`] byte codec for work-unit inputs and results.
//!
//! Payloads are opaque to the work manager, but the process pool has to
//! move them between address spaces. Every payload type therefore carries
//! a to-bytes / from-bytes capability. It is implemented for every serde
//! type via MessagePack (`rmp-serde`, named-field encoding, so field
//! reordering between master and worker builds is tolerated).

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::PayloadError;

/// A payload that can cross a process boundary without loss.
///
/// `from_bytes(to_bytes(x))` must equal `x` for every value the
/// propagator produces or consumes.
pub trait WirePayload: Send + Sync + Sized + 'static {
    /// Encode this value.
    fn to_bytes(&self) -> Result<Vec<u8>, PayloadError>;

    /// Decode a value previously produced by [`to_bytes`](Self::to_bytes).
    fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError>;
}

impl<T> WirePayload for T
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
