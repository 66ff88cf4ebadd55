pub mod configuration;
pub mod connectors;
pub mod console;
pub mod health;
pub mod helpers;
pub mod routes;
pub mod services;
pub mod startup;
pub mod telemetry;
