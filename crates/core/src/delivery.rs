//! Delivery status state machine.

use serde::{Deserialize, Serialize};

/// Provider-reported delivery status of an outbound message.
///
/// Forward transitions only: `sent → delivered → read`, with `failed`
/// reachable from any non-terminal status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
            DeliveryStatus::Failed => 3,
        }
    }

    /// Terminal statuses leave active tracking.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Read | DeliveryStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    ///
    /// Providers may skip steps (a read receipt without a delivery receipt),
    /// so any forward jump is legal. Repeats and regressions are not.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            DeliveryStatus::Failed => true,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

impl core::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
