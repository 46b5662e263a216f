//! Order fulfillment: the stock reservation saga and the order lifecycle.
//!
//! Placing an order reserves every line against the stock ledger, one
//! product lock at a time in ascending product order, and stores the order
//! only if all lines were reserved. A failed line releases the earlier ones
//! in reverse order before the caller hears about it.
//!
//! - [`StockReservationCoordinator`]: reserve, confirm and release stock
//! - [`OrderLifecycleEngine`]: create, cancel, return and the daily sweep
//! - [`CompensationListener`]: idempotent follow-up of published events
//! - [`SweepScheduler`]: runs the sweep in the background

pub mod clock;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod payment;
pub mod reservation;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{ReleaseReason, ReleaseReport, RetryPolicy, StockReservationCoordinator};
pub use error::{ErrorCode, FulfillmentError, ListenerError, Result};
pub use lifecycle::{LifecycleConfig, OrderLifecycleEngine, OrderReceipt, OrderView, SweepReport};
pub use listener::{CompensationListener, ListenerConfig, StuckMessage};
pub use payment::{
    InMemoryPaymentHistory, PaymentEntry, PaymentError, PaymentHistory, PaymentKind,
};
pub use reservation::{
    AttemptStatus, LineOutcome, ReservationAttempt, ReservationFailure, ReservationLine,
};
pub use scheduler::{SweepScheduler, spawn_periodic};
