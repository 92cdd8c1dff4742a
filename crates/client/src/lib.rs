// dentika-client library entry point: the realtime notification pipeline.

pub mod api;
pub mod auth;
pub mod config;
pub mod health;
pub mod notifications;
pub mod realtime;
pub mod runtime;
