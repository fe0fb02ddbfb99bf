//! `sellerflow-core`: primitives of the phased integration engine.
//!
//! This crate contains **pure** building blocks (no I/O): identifiers, the
//! phase catalog, and the clock abstraction shared by the queue, producer and
//! workers.

pub mod clock;
pub mod error;
pub mod id;
pub mod phase;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{PhaseError, PhaseResult};
pub use id::{JobId, RunId, SubjectId, UnitKey};
pub use phase::{Phase, PhaseDef, PhaseRegistry, INTEGRATION_PHASES};
