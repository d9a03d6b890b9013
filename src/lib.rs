//! Document repository service.
//!
//! A CRUD layer over a document store (timestamps, slugged names, unique
//! indexes, duplicate-key translation) and a blob storage layer with a local
//! read-through cache, exposed over HTTP.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod sanitizers;
pub mod services;
pub mod state;
