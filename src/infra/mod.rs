// Infrastructure adapters for app::ports
pub mod http_client;
