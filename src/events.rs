//! External event payloads consumed by the core.
//!
//! The chat-bot transport and the payment provider deliver these; the core
//! only cares about the user id, the idempotence key, and the amount.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Settlement state reported by the payment provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

/// Payment provider webhook payload.
///
/// Providers retry webhooks; `event_id` stays stable across redeliveries so
/// the reward ledger can suppress duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentNotice {
    pub invoice_id: String,
    pub user_id: String,
    pub amount: i64,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl PaymentNotice {
    /// Idempotence key: the transaction id when the provider assigned one,
    /// the invoice id otherwise.
    pub fn event_id(&self) -> String {
        match &self.transaction_id {
            Some(txn) => format!("payment:{txn}"),
            None => format!("payment:{}", self.invoice_id),
        }
    }
}

/// Kind of message arriving from the chat-bot transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotEventType {
    Message,
    PreCheckout,
    SuccessfulPayment,
    Callback,
}

/// Generic chat-bot webhook envelope. Command text stays opaque; the core
/// never parses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotEvent {
    pub event_type: BotEventType,
    pub external_user_id: String,
    #[serde(default)]
    pub payload: Value,
}
