//! sqsink - topic to queue to store relay
//!
//! Provisions an SNS topic, an SQS queue and its dead-letter queue, then
//! consumes the queue into a relational store with idempotent writes.
//! Messages are acknowledged only after the batch holding them is committed.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod credentials;
pub mod entity;
pub mod persist;
pub mod producer;
pub mod topology;
pub mod utils;
