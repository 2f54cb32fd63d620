//! Strongly-typed identifiers for iterations, work units, and workers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one iteration of the simulation driver's loop.
///
/// Iterations are numbered by the driver and must strictly increase
/// across successive `prepare_iteration` calls on a work manager.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct IterationId(pub u64);

impl fmt::Display for IterationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for IterationId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Identifies a work unit within one iteration.
///
/// Assigned by the driver. Unique per iteration; the same numeric id may
/// be reused in a later iteration.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WorkUnitId(pub u64);

impl fmt::Display for WorkUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for WorkUnitId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Identifies a worker slot (thread index or pooled process slot).
///
/// A slot keeps its id across process replacement; use the generation
/// carried alongside it to tell a replacement apart from its predecessor.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_ids_order_numerically() {
        assert!(IterationId(4) < IterationId(5));
        assert_eq!(IterationId::from(7), IterationId(7));
    }

    #[test]
    fn unit_id_display_is_prefixed() {
        assert_eq!(WorkUnitId(3).to_string(), "#3");
        assert_eq!(WorkerId(1).to_string(), "1");
    }
}
