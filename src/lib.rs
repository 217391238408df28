pub mod capture;
pub mod config;
pub mod http;
pub mod log;
pub mod stream;
