//! HTTP front for the covibe pipeline.

pub mod config;
pub mod limit;
pub mod server;
pub mod web;
