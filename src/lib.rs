pub mod auth;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod feed;
pub mod gaps;
pub mod limits;
pub mod model;
pub mod observability;
pub mod pricing;
pub mod sinks;
pub mod sql;
pub mod timestamp;
pub mod tls;
pub mod wal;
pub mod wire;
