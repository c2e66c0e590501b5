#![allow(clippy::collapsible_if)]
pub mod catalog;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod routes;
pub mod state;
pub mod streaming;
