//! Domain types for the kiln worker fleet.
//!
//! Everything here is pure: worker descriptors and the fixed catalog, the
//! on-disk layout, status precedence rules, install step ordering and the
//! error taxonomy shared by every other crate. The only I/O performed is
//! filesystem existence probes.

pub mod capability;
pub mod catalog;
pub mod error;
pub mod install;
pub mod layout;
pub mod status;
