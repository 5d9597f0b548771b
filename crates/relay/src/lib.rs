pub mod api;
pub mod app;
pub mod auth;
pub mod blob;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod protocol;
pub mod records;
pub mod sync;
pub mod ws;
