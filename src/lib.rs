//! Alert relay - turns device alerts into prioritized, deduplicated
//! notification tasks for an organization hierarchy.
//!
//! # Overview
//!
//! Each alert passes through four stages:
//!
//! 1. [`analyzer`] enriches it with confidence, urgency and recommended actions
//! 2. [`priority`] scores it to a priority (1 most urgent, 10 least), a
//!    processing deadline and an escalation chain
//! 3. [`distribution`] plans recipients by org depth and generates one task per recipient
//! 4. [`queue`] admits tasks into priority lanes, suppressing duplicate
//!    `(alert, recipient)` pairs within a TTL
//!
//! A [`dispatch`] worker drains the queue in priority order and hands batches
//! to a channel dispatcher. Scoring stages never fail: collaborator errors and
//! internal faults degrade to safe defaults. Only an alert with nobody to
//! notify is reported back to the caller.
//!
//! # Modules
//!
//! - [`model`]: Alert, priority and notification task types
//! - [`config`]: Environment configuration
//! - [`error`]: Pipeline error type
//! - [`pipeline`]: End-to-end orchestration
//! - [`storage`]: SQLite-backed hierarchy and delivery tracking
//! - [`api`]: HTTP API handlers

pub mod analyzer;
pub mod api;
pub mod config;
pub mod dispatch;
pub mod distribution;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod priority;
pub mod queue;
pub mod storage;
