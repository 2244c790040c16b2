pub mod api;
pub mod capture;
pub mod config;
pub mod router;
pub mod server;
