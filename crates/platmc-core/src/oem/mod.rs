// ── Vendor capability resolution ──
//
// Enumeration and polling consult a resolver for everything the
// standard record types do not cover: vendor records, capabilities a
// vendor terminus implies but never describes, and vendor meanings for
// state values.

pub mod ibm;

use platmc_proto::pdr::OemPdr;

use crate::model::{CapabilityDescriptor, CompositeId, Reading, Tid};

pub use ibm::IbmResolver;

/// Vendor hooks used while building catalogs and publishing readings.
///
/// Every method has a neutral default, so a resolver only overrides
/// what its vendor needs.
pub trait CapabilityResolver: Send + Sync {
    /// Interpret a vendor record. `None` skips it.
    fn resolve_composite(&self, _tid: Tid, _record: &OemPdr) -> Option<CapabilityDescriptor> {
        None
    }

    /// Capabilities to append after enumeration. `vendors` lists the
    /// IANA numbers of every vendor record seen, `found` the catalog so
    /// far.
    fn extra_records(
        &self,
        _tid: Tid,
        _vendors: &[u32],
        _found: &[CapabilityDescriptor],
    ) -> Vec<CapabilityDescriptor> {
        Vec::new()
    }

    /// Rewrite a decoded reading before it is published.
    fn decode_reading(&self, _id: &CompositeId, reading: Reading) -> Reading {
        reading
    }
}

/// Standard records only.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardResolver;

impl CapabilityResolver for StandardResolver {}
