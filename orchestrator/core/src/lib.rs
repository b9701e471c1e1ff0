// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Module host core
//!
//! Installs, runs and tears down Docker-packaged modules: port allocation,
//! sandbox policy, reverse-proxy wiring and an append-only audit trail.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, lifecycle orchestration and adapters

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
