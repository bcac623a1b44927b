// Keel Kernel
//
// Bootstrap stage of the batch pipeline: provisions the table set
// and consolidates per-task metadata fragments into one record per
// entity.

pub mod config;
pub mod job;
pub mod merge;
pub mod metadata;
pub mod schema;
pub mod status;
pub mod store;
