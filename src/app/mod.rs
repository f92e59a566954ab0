// Application-level seams implemented by infra adapters
pub mod ports;
