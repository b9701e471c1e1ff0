// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the modman CLI

pub mod config;
pub mod module;

pub use self::config::ConfigCommand;
pub use self::module::ModuleCommand;
