//! `zsnapd`: a daemon that snapshots, replicates and ages out ZFS datasets
//! according to a tiered keep-hours/days/weeks/months/years retention
//! schema. Module layout follows `zcrab`'s flat `src/*.rs` shape, one
//! module per collaborator named in the design rather than nested under a
//! `lib`/`bin` split.

pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod logging;
pub mod retention;
pub mod schema;
pub mod scheduler;
pub mod time;
pub mod zfs;
