//! Subscription Billing - advances subscription billing periods, materializes
//! invoices for elapsed periods and hands them to downstream processing.

pub mod config;
pub mod engine;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
