// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus - Pub/Sub for module lifecycle events
//
// In-memory fan-out over a tokio broadcast channel. Events are lost on
// restart; the audit log is the durable record of what happened.

use crate::domain::events::ModuleEvent;
use crate::domain::module::ModuleName;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to module events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<ModuleEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity.
    /// Slow subscribers lose the oldest events once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish to all current subscribers. Never blocks and never fails.
    pub fn publish(&self, event: ModuleEvent) {
        debug!(module = %event.module(), "Publishing event: {:?}", event);

        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of a single module.
    pub fn subscribe_module(&self, module: ModuleName) -> ModuleEventReceiver {
        ModuleEventReceiver {
            receiver: self.sender.subscribe(),
            module,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all module events
pub struct EventReceiver {
    receiver: broadcast::Receiver<ModuleEvent>,
}

impl EventReceiver {
    /// Receive the next event, waiting until one is available
    pub async fn recv(&mut self) -> Result<ModuleEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<ModuleEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one module; events of other modules are skipped.
pub struct ModuleEventReceiver {
    receiver: broadcast::Receiver<ModuleEvent>,
    module: ModuleName,
}

impl ModuleEventReceiver {
    pub async fn recv(&mut self) -> Result<ModuleEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.module() == &self.module {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn name(s: &str) -> ModuleName {
        ModuleName::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish(ModuleEvent::PortsAllocated {
            module: name("crm"),
            ports: BTreeMap::from([(8080, 9000)]),
            allocated_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            ModuleEvent::PortsAllocated { module, ports, .. } => {
                assert_eq!(module.as_str(), "crm");
                assert_eq!(ports.get(&8080), Some(&9000));
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }

    #[tokio::test]
    async fn test_module_event_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_module(name("crm"));

        event_bus.publish(ModuleEvent::InstallStarted {
            module: name("wiki"),
            actor: "alice".to_string(),
            started_at: Utc::now(),
        });
        event_bus.publish(ModuleEvent::InstallStarted {
            module: name("crm"),
            actor: "bob".to_string(),
            started_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            ModuleEvent::InstallStarted { module, actor, .. } => {
                assert_eq!(module.as_str(), "crm");
                assert_eq!(actor, "bob");
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let event_bus = EventBus::default();
        assert_eq!(event_bus.subscriber_count(), 0);
        event_bus.publish(ModuleEvent::ModuleUninstalled {
            module: name("crm"),
            released_ports: 1,
            uninstalled_at: Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_lagging_receiver_reports_dropped_events() {
        let event_bus = EventBus::new(1);
        let mut receiver = event_bus.subscribe();
        for _ in 0..3 {
            event_bus.publish(ModuleEvent::ModuleUninstalled {
                module: name("crm"),
                released_ports: 0,
                uninstalled_at: Utc::now(),
            });
        }
        assert!(matches!(receiver.recv().await, Err(EventBusError::Lagged(2))));
    }
}
