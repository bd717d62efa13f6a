//! Background services running alongside the datastore
//!
//! - `folder_liveness`: releases live folder handles once they go quiet

pub mod folder_liveness;

pub use folder_liveness::FolderLivenessTracker;
