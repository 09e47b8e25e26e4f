pub mod config;
pub mod context;
pub mod convert;
pub mod download;
pub mod error;
pub mod metadata;
pub mod quota;
pub mod server;
