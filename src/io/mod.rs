//! Chain persistence: the full step array of a run as CSV, or as Parquet when
//! the `parquet` feature is enabled.

pub mod csv;

#[cfg(feature = "parquet")]
pub mod parquet;
