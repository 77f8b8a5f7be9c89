pub mod clock;
pub mod config;
pub mod http;
pub mod identity;
pub mod lease;
pub mod limits;
pub mod model;
pub mod observability;
pub mod store;
pub mod wal;
