//! Relation protocols served to other applications

pub mod database;
pub mod s3;

pub use database::{DatabaseProvider, RequestOutcome};
pub use s3::S3Parameters;
