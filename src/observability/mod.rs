// Observability: metrics (logging lives in crate::logging)

pub mod metrics;

pub use self::metrics::init;
