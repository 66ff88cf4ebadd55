pub mod cache;
mod callable;
pub mod credentials;
pub mod webhook;

pub use callable::*;
