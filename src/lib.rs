pub mod access;
pub mod api;
pub mod blob;
pub mod config;
pub mod error;
pub mod hashutil;
pub mod ids;
pub mod logging;
pub mod principal;
pub mod realtime;
pub mod server;
pub mod store;
pub mod sync;
