//! Raw webhook payload audit records.

use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct WebhookPayload {
    pub id: String,
    pub delivery_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub received_at: String,
}
