pub mod ai;
pub mod app;
pub mod cache;
pub mod change_feed;
pub mod chat;
pub mod config;
pub mod error;
pub mod messages;
pub mod models;
pub mod notifications;
pub mod presence;
pub mod rate_limit;
pub mod room;
pub mod server;
pub mod store;
pub mod sweep;
