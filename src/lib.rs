// Modules
pub mod config;
pub mod evaluation;
pub mod evolution;
pub mod grammar;
pub mod handlers;
pub mod individual;
pub mod island;
pub mod problems;
pub mod store;
pub mod tree;
pub mod web_app;
