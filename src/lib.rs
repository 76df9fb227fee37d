pub mod app;
pub mod auth;
pub mod client;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod output;
pub mod peaks;
pub mod retry;
pub mod sniff;
