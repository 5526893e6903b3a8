//! subscription-service: weekly prepaid subscriptions billed from a balance ledger.

pub mod billing;
pub mod config;
pub mod error;
pub mod grpc;
pub mod models;
pub mod notification;
pub mod services;
pub mod startup;
