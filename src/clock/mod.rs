//! Causality (C2): vector clocks for partial ordering across replicas, and
//! a hybrid logical clock for the total order conflict resolution needs.

pub mod hlc;
pub mod vector_clock;

pub use hlc::{HlClock, Hlc};
pub use vector_clock::{VectorClock, VectorClockRelation};
