//! Terminus lifecycle and sensor polling engine.
//!
//! - **[`Manager`]**: central facade. Receives attach/detach batches from
//!   the transport, drives each endpoint through discovery, capability
//!   enumeration and polling, and exposes per-terminus control
//!   ([`start_polling`](Manager::start_polling),
//!   [`stop_polling`](Manager::stop_polling),
//!   [`set_availability`](Manager::set_availability)).
//!
//! - **[`TerminusRegistry`]**: concurrent store of live termini built on
//!   `DashMap` with a `tokio::sync::watch` snapshot. Allocates TIDs and is
//!   the only owner of [`Terminus`] values; everything else holds a [`Tid`].
//!
//! - **Sub-managers**: [`TerminusManager`] (GetTID / SetTID / GetPLDMTypes
//!   with bounded retries and cancellable probes), [`PlatformManager`]
//!   (GetPDR walk into a [`Catalog`]) and [`SensorManager`] (one
//!   cancellable polling task per terminus, gated on its availability
//!   flag).
//!
//! - **Seams**: [`Telemetry`] receives readings and faults,
//!   [`CapabilityResolver`] supplies vendor interpretation, and
//!   [`DiscoveryHooks`] run around each attach batch.

pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod model;
pub mod oem;
pub mod platform_manager;
pub mod registry;
mod requester;
pub mod sensor_manager;
pub mod telemetry;
pub mod terminus_manager;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{ManagerConfig, RetryPolicy};
pub use error::CoreError;
pub use event::ManagerEvent;
pub use manager::{DiscoveryHooks, HookError, Manager, ManagerBuilder, NoHooks};
pub use oem::{CapabilityResolver, IbmResolver, StandardResolver};
pub use platform_manager::{EnumerationReport, PlatformManager};
pub use registry::TerminusRegistry;
pub use sensor_manager::SensorManager;
pub use telemetry::{ChannelTelemetry, Telemetry, TelemetryEvent, TracingTelemetry};
pub use terminus_manager::{DiscoveryTicket, TerminusManager};

pub use model::{
    CapabilityDescriptor, CapabilityKind, Catalog, CompositeId, Decoder, FaultKind,
    NumericFormat, Reading, Terminus, TerminusKey, TerminusState, Tid,
};
