pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod lifecycle;
pub mod models;
pub mod parser;
pub mod profiles;
pub mod security;
