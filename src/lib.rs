pub mod agent;
pub mod config;
pub mod errors;
pub mod ingest;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod store;
pub mod vcs;
pub mod workspace;
