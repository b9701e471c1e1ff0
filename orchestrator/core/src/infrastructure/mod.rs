// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod db;
pub mod event_bus;
pub mod license;
pub mod port_registry;
pub mod proxy;
pub mod repositories;
pub mod runtime;

pub use event_bus::EventBus;
pub use license::{LicenseSealer, RevocationListValidator};
pub use port_registry::InMemoryPortRegistry;
pub use proxy::{CommandProxyController, NginxProxyConfigurator};
pub use runtime::DockerContainerRuntime;
