pub mod auth;
pub mod form;
pub mod handlers;
pub mod models;
pub mod server;
