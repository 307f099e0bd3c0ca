pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod http;
pub mod introspect;
pub mod model;
pub mod paginate;
pub mod platform;
pub mod restore;
pub mod runner;
pub mod snapshot;
