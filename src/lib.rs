pub mod auth;
pub mod clients;
pub mod configuration;
pub mod error;
pub mod middleware;
pub mod purpose_token;
pub mod resilience;
pub mod routes;
pub mod session_manager;
pub mod startup;
pub mod store;
pub mod telemetry;
pub mod validators;
