//! Recurrent (card-on-file) charge scheduling and payment status tracking.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;
