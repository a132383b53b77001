pub mod bson;
pub mod connection;
pub mod error;
pub mod helpers;
pub mod models;
pub mod state;
