pub mod config;
pub mod error;
pub mod event_handler;
pub mod handlers;
pub mod model;
pub mod store;
pub mod usecase;
