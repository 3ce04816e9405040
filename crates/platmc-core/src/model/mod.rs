// ── Domain model ──
//
// Types describing termini, their capabilities and the readings
// published for them.

pub mod capability;
pub mod reading;
pub mod terminus;

pub use capability::{
    CapabilityDescriptor, CapabilityKind, Catalog, CompositeId, Decoder, NumericFormat,
};
pub use reading::{FaultKind, Reading};
pub use terminus::{Terminus, TerminusKey, TerminusState, Tid};
