//! Order status state machine.

use serde::{Deserialize, Serialize};

/// The status of an order in its lifecycle.
///
/// Status transitions:
/// ```text
/// OrderReceived ──► Delivering ──► DeliveryCompleted ──► ReturnRequested ──► ReturnCompleted
///       │
///       └──► Cancelled
/// ```
///
/// Forward moves along the main line are made by the scheduled sweep;
/// `Cancelled` and `ReturnRequested` are reached only by owner actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Stock reserved and order persisted; not yet shipped.
    #[default]
    OrderReceived,

    /// Order is out for delivery.
    Delivering,

    /// Order was delivered. A return may be requested for one day.
    DeliveryCompleted,

    /// Order was cancelled before delivery (terminal state).
    Cancelled,

    /// Owner asked to return a delivered order.
    ReturnRequested,

    /// Return was processed and stock restored (terminal state).
    ReturnCompleted,
}

impl OrderStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::OrderReceived,
        OrderStatus::Delivering,
        OrderStatus::DeliveryCompleted,
        OrderStatus::Cancelled,
        OrderStatus::ReturnRequested,
        OrderStatus::ReturnCompleted,
    ];

    /// Returns true if the owner may cancel in this status.
    pub fn can_cancel(&self) -> bool {
        matches!(self, OrderStatus::OrderReceived)
    }

    /// Returns true if the owner may request a return in this status.
    ///
    /// The return window is checked separately against the delivery date.
    pub fn can_request_return(&self) -> bool {
        matches!(self, OrderStatus::DeliveryCompleted)
    }

    /// Returns the status the scheduled sweep advances this status to, if any.
    pub fn scheduled_next(&self) -> Option<OrderStatus> {
        match self {
            OrderStatus::OrderReceived => Some(OrderStatus::Delivering),
            OrderStatus::Delivering => Some(OrderStatus::DeliveryCompleted),
            OrderStatus::ReturnRequested => Some(OrderStatus::ReturnCompleted),
            OrderStatus::DeliveryCompleted
            | OrderStatus::Cancelled
            | OrderStatus::ReturnCompleted => None,
        }
    }

    /// Returns true if moving from `self` to `to` is a legal transition.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        match (self, to) {
            (OrderStatus::OrderReceived, OrderStatus::Cancelled) => true,
            (OrderStatus::DeliveryCompleted, OrderStatus::ReturnRequested) => true,
            (from, to) => from.scheduled_next() == Some(to),
        }
    }

    /// Returns true if this is a terminal status (no further transitions possible).
    ///
    /// `DeliveryCompleted` is not terminal while a return can still be requested.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::ReturnCompleted)
    }

    /// Returns true if reaching this status gives the order's stock back.
    pub fn restores_stock(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::ReturnCompleted)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::OrderReceived => "ORDER_RECEIVED",
            OrderStatus::Delivering => "DELIVERING",
            OrderStatus::DeliveryCompleted => "DELIVERY_COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::ReturnRequested => "RETURN_REQUESTED",
            OrderStatus::ReturnCompleted => "RETURN_COMPLETED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A stored status string that matches no [`OrderStatus`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order status: {0}")]
pub struct UnknownStatus(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_order_received() {
        assert_eq!(OrderStatus::default(), OrderStatus::OrderReceived);
    }

    #[test]
    fn test_only_order_received_can_cancel() {
        for status in OrderStatus::ALL {
            assert_eq!(status.can_cancel(), status == OrderStatus::OrderReceived);
        }
    }

    #[test]
    fn test_only_delivery_completed_can_request_return() {
        for status in OrderStatus::ALL {
            assert_eq!(
                status.can_request_return(),
                status == OrderStatus::DeliveryCompleted
            );
        }
    }

    #[test]
    fn test_scheduled_path() {
        assert_eq!(
            OrderStatus::OrderReceived.scheduled_next(),
            Some(OrderStatus::Delivering)
        );
        assert_eq!(
            OrderStatus::Delivering.scheduled_next(),
            Some(OrderStatus::DeliveryCompleted)
        );
        assert_eq!(
            OrderStatus::ReturnRequested.scheduled_next(),
            Some(OrderStatus::ReturnCompleted)
        );
        assert_eq!(OrderStatus::DeliveryCompleted.scheduled_next(), None);
        assert_eq!(OrderStatus::Cancelled.scheduled_next(), None);
    }

    #[test]
    fn test_cancel_from_delivering_is_illegal() {
        assert!(!OrderStatus::Delivering.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::DeliveryCompleted.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::OrderReceived.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::ReturnCompleted.is_terminal());
        assert!(!OrderStatus::DeliveryCompleted.is_terminal());
        assert!(!OrderStatus::OrderReceived.is_terminal());
    }

    #[test]
    fn test_string_round_trip() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("SHIPPED".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_serialization_uses_wire_names() {
        let json = serde_json::to_string(&OrderStatus::ReturnRequested).unwrap();
        assert_eq!(json, "\"RETURN_REQUESTED\"");
    }
}
