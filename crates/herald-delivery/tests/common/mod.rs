//! Shared environment for delivery integration tests.
//!
//! Every test runs against virtual time and an in-memory transport, so the
//! retry and rate-limit windows can be crossed without waiting.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_core::{
    events::{EventHandler, NotificationEvent},
    models::{NotificationId, NotificationRecord, NotificationStatus},
    time::{Clock, ManualClock},
};
use herald_delivery::{
    scheduler::TickOutcome,
    transport::{
        mock::{Gate, MockBehavior, MockTransport},
        Transport,
    },
    NotificationService, ServiceConfig,
};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Event handler that keeps everything it receives.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<NotificationEvent>>,
}

impl EventLog {
    pub async fn all(&self) -> Vec<NotificationEvent> {
        self.events.lock().await.clone()
    }

    pub async fn for_notification(&self, id: NotificationId) -> Vec<NotificationEvent> {
        self.events.lock().await.iter().filter(|e| e.notification_id() == id).cloned().collect()
    }
}

#[async_trait]
impl EventHandler for EventLog {
    async fn handle_event(&self, event: NotificationEvent) {
        self.events.lock().await.push(event);
    }
}

/// Service wired to a manual clock, a mock transport and an event log.
pub struct TestEnv {
    pub clock: ManualClock,
    pub transport: Arc<MockTransport>,
    pub events: Arc<EventLog>,
    pub service: Arc<NotificationService>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        Self::build(config, MockBehavior::Succeed, false).0
    }

    pub fn with_behavior(config: ServiceConfig, behavior: MockBehavior) -> Self {
        Self::build(config, behavior, false).0
    }

    /// Environment whose transport blocks each call until the gate opens.
    pub fn gated(config: ServiceConfig) -> (Self, Arc<Gate>) {
        let (env, gate) = Self::build(config, MockBehavior::Succeed, true);
        (env, gate.unwrap_or_default())
    }

    fn build(
        config: ServiceConfig,
        behavior: MockBehavior,
        gated: bool,
    ) -> (Self, Option<Arc<Gate>>) {
        init_tracing();

        let clock = ManualClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());

        let mock = MockTransport::new(shared_clock.clone(), behavior);
        let (mock, gate) = if gated {
            let (mock, gate) = mock.with_gate();
            (mock, Some(gate))
        } else {
            (mock, None)
        };

        let transport = Arc::new(mock);
        let events = Arc::new(EventLog::default());
        let service = Arc::new(NotificationService::with_event_handler(
            transport.clone() as Arc<dyn Transport>,
            config,
            shared_clock,
            events.clone(),
        ));

        (Self { clock, transport, events, service }, gate)
    }

    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    pub async fn tick(&self) -> TickOutcome {
        self.service.tick().await
    }

    /// Ticks until the scheduler reports nothing to do.
    pub async fn tick_until_idle(&self, max_ticks: usize) -> usize {
        for ticks in 0..max_ticks {
            if self.service.tick().await == TickOutcome::Idle {
                return ticks;
            }
        }
        max_ticks
    }

    pub async fn record(&self, id: NotificationId) -> NotificationRecord {
        self.service.status(id).await.expect("record should be known")
    }

    pub async fn status(&self, id: NotificationId) -> NotificationStatus {
        self.record(id).await.status
    }
}

/// Default config with a different attempt limit.
pub fn config_with_retries(max_retries: u32) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.retry_policy.max_retries = max_retries;
    config
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,herald_delivery=debug")),
        )
        .with_test_writer()
        .try_init();
}
