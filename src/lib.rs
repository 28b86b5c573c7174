pub mod compactor;
pub mod engine;
pub mod limits;
pub mod model;
pub mod net;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod sql;
pub mod tenant;
pub mod wal;
pub mod wire;
