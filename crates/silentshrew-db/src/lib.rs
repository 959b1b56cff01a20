//! Scalar repository backends.
//!
//! Both backends implement the `ScalarRepository` contract: height-keyed
//! entries, a monotone watermark, and spent-output invalidation with the
//! delete-on-fully-spent cascade. RocksDB is the embedded default; Postgres
//! suits multi-process deployments.

pub mod postgres;
pub mod rocks;

pub use postgres::PgScalarRepository;
pub use rocks::RocksScalarRepository;
