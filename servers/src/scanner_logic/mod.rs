pub mod auth;
pub mod catalyst;
pub mod config;
pub mod consumers;
pub mod downstream;
pub mod filters;
pub mod index;
pub mod logger;
pub mod model;
pub mod monitor;
pub mod pubsub;
pub mod registry;
pub mod sampler;
pub mod snapshot;
pub mod state;
pub mod upstream;
