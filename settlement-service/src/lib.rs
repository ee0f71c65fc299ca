//! Settlement Service - metering intake, settlement, invoicing and payment matching.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
