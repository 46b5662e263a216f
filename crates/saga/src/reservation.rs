//! One multi-product reservation attempt and its per-line outcomes.

use common::ProductId;
use domain::LineItem;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a single line within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LineOutcome {
    /// Not tried yet.
    #[default]
    Pending,
    /// Stock was taken for this line.
    Reserved,
    /// This line could not be reserved.
    Failed,
    /// Stock was taken and later given back during compensation.
    Released,
}

/// Status of a reservation attempt.
///
/// ```text
/// InProgress ──┬──► Reserved
///              └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AttemptStatus {
    #[default]
    InProgress,
    /// Every line was reserved (terminal state).
    Reserved,
    /// A line failed and earlier lines were compensated (terminal state).
    Failed,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Reserved | AttemptStatus::Failed)
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationFailure {
    /// Not enough stock; never retried.
    InsufficientStock { product_id: ProductId },
    /// Lock or store trouble that outlasted the retry.
    Transient { product_id: ProductId, message: String },
    /// The product has no stock record at all.
    UnknownProduct { product_id: ProductId },
}

impl ReservationFailure {
    pub fn product_id(&self) -> &ProductId {
        match self {
            ReservationFailure::InsufficientStock { product_id }
            | ReservationFailure::Transient { product_id, .. }
            | ReservationFailure::UnknownProduct { product_id } => product_id,
        }
    }

    /// Label used for the `outcome` metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            ReservationFailure::InsufficientStock { .. } => "insufficient_stock",
            ReservationFailure::Transient { .. } => "transient",
            ReservationFailure::UnknownProduct { .. } => "invalid_product",
        }
    }
}

/// A line of an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLine {
    pub item: LineItem,
    pub outcome: LineOutcome,
}

/// Result of reserving every line of an order.
///
/// Lines are held in ascending product order, which is also the order the
/// product locks were taken in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationAttempt {
    attempt_id: Uuid,
    lines: Vec<ReservationLine>,
    status: AttemptStatus,
    failure: Option<ReservationFailure>,
}

impl ReservationAttempt {
    /// Starts an attempt over already-normalized items.
    pub(crate) fn start(items: Vec<LineItem>) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            lines: items
                .into_iter()
                .map(|item| ReservationLine {
                    item,
                    outcome: LineOutcome::Pending,
                })
                .collect(),
            status: AttemptStatus::InProgress,
            failure: None,
        }
    }

    pub(crate) fn mark(&mut self, index: usize, outcome: LineOutcome) {
        if let Some(line) = self.lines.get_mut(index) {
            line.outcome = outcome;
        }
    }

    pub(crate) fn succeed(&mut self) {
        self.status = AttemptStatus::Reserved;
    }

    pub(crate) fn fail(&mut self, failure: ReservationFailure) {
        self.status = AttemptStatus::Failed;
        self.failure = Some(failure);
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn status(&self) -> AttemptStatus {
        self.status
    }

    pub fn is_reserved(&self) -> bool {
        self.status == AttemptStatus::Reserved
    }

    pub fn failure(&self) -> Option<&ReservationFailure> {
        self.failure.as_ref()
    }

    pub fn lines(&self) -> &[ReservationLine] {
        &self.lines
    }

    /// Indexes of lines currently holding stock, in reservation order.
    pub fn reserved_indexes(&self) -> Vec<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.outcome == LineOutcome::Reserved)
            .map(|(index, _)| index)
            .collect()
    }

    /// The items of lines currently holding stock.
    pub fn reserved_items(&self) -> Vec<LineItem> {
        self.lines
            .iter()
            .filter(|line| line.outcome == LineOutcome::Reserved)
            .map(|line| line.item.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_items_follow_outcomes() {
        let mut attempt = ReservationAttempt::start(vec![
            LineItem::new("SKU-1", 1),
            LineItem::new("SKU-2", 2),
            LineItem::new("SKU-3", 3),
        ]);
        attempt.mark(0, LineOutcome::Reserved);
        attempt.mark(1, LineOutcome::Reserved);
        attempt.mark(2, LineOutcome::Failed);

        assert_eq!(attempt.reserved_indexes(), vec![0, 1]);
        attempt.mark(1, LineOutcome::Released);
        assert_eq!(attempt.reserved_items(), vec![LineItem::new("SKU-1", 1)]);
    }

    #[test]
    fn test_terminal_statuses() {
        let mut attempt = ReservationAttempt::start(vec![LineItem::new("SKU-1", 1)]);
        assert!(!attempt.status().is_terminal());

        attempt.fail(ReservationFailure::InsufficientStock {
            product_id: ProductId::new("SKU-1"),
        });
        assert_eq!(attempt.status(), AttemptStatus::Failed);
        assert!(attempt.status().is_terminal());
        assert_eq!(attempt.failure().unwrap().outcome(), "insufficient_stock");
    }
}
