// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Aggregates, value objects and the ports (traits) that infrastructure
//! adapters implement.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Module lifecycle model and collaborator contracts

pub mod module;
pub mod port;
pub mod security;
pub mod proxy;
pub mod runtime;
pub mod audit;
pub mod license;
pub mod events;
pub mod repository;
pub mod config;
