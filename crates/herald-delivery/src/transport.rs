//! Transport contract between the queue and the messaging channel.
//!
//! The engine depends on the channel only through [`Transport`]: hand over
//! one message, get back success or a [`DeliveryError`]. Production uses
//! [`crate::client::BotApiTransport`]; tests use [`mock::MockTransport`].

use std::{future::Future, pin::Pin};

use herald_core::models::{NotificationContent, NotificationId, NotificationRecord, Recipient};

use crate::error::Result;

/// One delivery attempt as seen by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Record being delivered.
    pub notification_id: NotificationId,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Destination.
    pub recipient: Recipient,
    /// Text and rendering hints.
    pub content: NotificationContent,
}

impl From<&NotificationRecord> for OutboundMessage {
    fn from(record: &NotificationRecord) -> Self {
        Self {
            notification_id: record.id,
            attempt_number: record.attempt_number(),
            recipient: record.recipient.clone(),
            content: record.content.clone(),
        }
    }
}

/// Confirmation returned by a successful delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Channel-assigned message identifier, if the channel reports one.
    pub message_ref: Option<String>,
}

/// Hands messages to the external channel.
///
/// Any error is a delivery failure. Implementations should not retry
/// internally; the queue owns retry decisions.
pub trait Transport: Send + Sync + std::fmt::Debug + 'static {
    /// Delivers one message.
    fn deliver(
        &self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt>> + Send + '_>>;
}

pub mod mock {
    //! Scripted transport for tests.
    //!
    //! Records every call with the injected clock's timestamp and answers
    //! according to a configurable [`MockBehavior`]. An optional gate holds
    //! calls open so tests can act while a delivery is in flight.

    use std::{future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use herald_core::{
        models::{NotificationId, Recipient},
        time::Clock,
    };
    use tokio::sync::{Mutex, Notify};

    use super::{DeliveryReceipt, OutboundMessage, Transport};
    use crate::error::{DeliveryError, Result};

    /// How the mock answers.
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Every call succeeds.
        Succeed,
        /// Every call fails with the given error.
        Fail(DeliveryError),
        /// The first `n` calls fail, later ones succeed.
        FailTimes(u32, DeliveryError),
        /// Calls never complete.
        Hang,
        /// Calls panic.
        Panic,
        /// Calls for this recipient panic, others succeed.
        PanicFor(Recipient),
    }

    /// A call observed by the mock.
    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedCall {
        /// Record that was delivered.
        pub notification_id: NotificationId,
        /// Attempt number reported by the engine.
        pub attempt_number: u32,
        /// Destination.
        pub recipient: Recipient,
        /// Message text.
        pub text: String,
        /// Clock reading when the call started.
        pub at: DateTime<Utc>,
    }

    /// Holds calls open until released.
    #[derive(Debug, Default)]
    pub struct Gate {
        entered: Notify,
        release: Notify,
    }

    impl Gate {
        /// Waits until a call is blocked on the gate.
        pub async fn entered(&self) {
            self.entered.notified().await;
        }

        /// Lets one blocked call continue.
        pub fn release(&self) {
            self.release.notify_one();
        }
    }

    /// In-memory transport double.
    #[derive(Debug)]
    pub struct MockTransport {
        clock: Arc<dyn Clock>,
        behavior: Mutex<MockBehavior>,
        calls: Mutex<Vec<RecordedCall>>,
        gate: Option<Arc<Gate>>,
    }

    impl MockTransport {
        /// Creates a mock with the given behavior.
        pub fn new(clock: Arc<dyn Clock>, behavior: MockBehavior) -> Self {
            Self { clock, behavior: Mutex::new(behavior), calls: Mutex::new(Vec::new()), gate: None }
        }

        /// Mock whose calls always succeed.
        pub fn succeeding(clock: Arc<dyn Clock>) -> Self {
            Self::new(clock, MockBehavior::Succeed)
        }

        /// Adds a gate that blocks each call until released.
        #[must_use]
        pub fn with_gate(mut self) -> (Self, Arc<Gate>) {
            let gate = Arc::new(Gate::default());
            self.gate = Some(gate.clone());
            (self, gate)
        }

        /// Replaces the behavior for subsequent calls.
        pub async fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().await = behavior;
        }

        /// Every call seen so far, in order.
        pub async fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().await.clone()
        }

        /// Number of calls seen so far.
        pub async fn call_count(&self) -> usize {
            self.calls.lock().await.len()
        }

        /// Calls made for one record.
        pub async fn calls_for(&self, id: NotificationId) -> Vec<RecordedCall> {
            self.calls.lock().await.iter().filter(|call| call.notification_id == id).cloned().collect()
        }

        async fn answer(&self, recipient: &Recipient) -> Result<DeliveryReceipt> {
            let outcome = {
                let mut behavior = self.behavior.lock().await;
                match &mut *behavior {
                    MockBehavior::Succeed => Some(Ok(DeliveryReceipt::default())),
                    MockBehavior::Fail(error) => Some(Err(error.clone())),
                    MockBehavior::FailTimes(0, _) => Some(Ok(DeliveryReceipt::default())),
                    MockBehavior::FailTimes(remaining, error) => {
                        *remaining -= 1;
                        Some(Err(error.clone()))
                    },
                    MockBehavior::Hang => None,
                    MockBehavior::Panic => panic!("mock transport panicked"),
                    MockBehavior::PanicFor(target) if *target == *recipient => {
                        panic!("mock transport panicked for {recipient}")
                    },
                    MockBehavior::PanicFor(_) => Some(Ok(DeliveryReceipt::default())),
                }
            };

            match outcome {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    impl Transport for MockTransport {
        fn deliver(
            &self,
            message: OutboundMessage,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt>> + Send + '_>> {
            Box::pin(async move {
                let call_index = {
                    let mut calls = self.calls.lock().await;
                    calls.push(RecordedCall {
                        notification_id: message.notification_id,
                        attempt_number: message.attempt_number,
                        recipient: message.recipient.clone(),
                        text: message.content.text,
                        at: self.clock.now_utc(),
                    });
                    calls.len()
                };

                if let Some(gate) = &self.gate {
                    gate.entered.notify_one();
                    gate.release.notified().await;
                }

                let result = self.answer(&message.recipient).await;
                result.map(|mut receipt| {
                    receipt.message_ref = Some(call_index.to_string());
                    receipt
                })
            })
        }
    }
}
