//! Job lifecycle and retry reconciliation for a biological data refinery.
//!
//! Downloader jobs fetch source archives and split them into batches;
//! processor jobs run each batch through a staged pipeline. The foreman
//! sweeps for failed, hung and lost jobs and requeues them until their
//! retries run out.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
