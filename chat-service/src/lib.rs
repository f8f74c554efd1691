pub mod config;
pub mod handlers;
pub mod middleware;
pub mod services;
pub mod startup;
