//! Attestation observer bus (spec §4.6, C6).

pub mod bus;

pub use bus::{AttestationBus, AttestationObserver, IngestStatus};
