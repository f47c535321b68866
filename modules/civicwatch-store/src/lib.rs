//! Postgres-backed [`ReportStore`](civicwatch_verify::store::ReportStore).
//!
//! The contract the engine needs from persistence is narrow: a conditional
//! UPDATE is the claim CAS, and a transaction makes each status change
//! atomic with its timeline append. Candidate queries are plain indexed
//! scans over hash buckets and geohash cells.

pub mod migrate;
pub mod store;

pub use migrate::migrate;
pub use store::PgReportStore;
