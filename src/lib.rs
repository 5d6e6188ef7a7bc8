pub mod catalog;
pub mod common;
pub mod config;
pub mod convention;
pub mod credential;
pub mod error;
pub mod manifest;
pub mod probe;
pub mod server;
pub mod status;
pub mod submit;
pub mod transport;
