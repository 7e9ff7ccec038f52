//! rowlineage engine - row identity and pairing
//!
//! - Deterministic trace identifiers derived from row content
//! - Row pair capture between an upstream and a downstream result set

pub mod capture;
pub mod identity;

pub use capture::{CaptureError, CaptureOutcome, RowPairCapturer, Side};
pub use identity::{canonical_payload, derive, is_derived, trace_id_or_derive, DeriveError};
