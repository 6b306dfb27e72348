//! Domain models - core counting types
//!
//! This module contains the canonical data types used throughout the system:
//! - `TrackId` / `ClassId` - identifiers supplied by the external tracker
//! - `Category` - recognized vehicle classes
//! - `ObservationBatch` - mapped observations of one tracker frame
//! - `CountSnapshot` - deduplicated counts for one window

pub mod snapshot;
pub mod types;
