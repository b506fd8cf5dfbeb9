//! Receipt Tracker
//!
//! Append-only logs of delivery and read receipts. Receipts have no identity
//! beyond their (sender, timestamp) pair and redundant server delivery is
//! expected, so duplicates are recorded as additional entries.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

/// Delivery receipt entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub source: String,
    pub source_device: u32,
    /// Timestamp of the delivered message
    pub timestamp: i64,
}

/// Read receipt entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub sender: String,
    /// Timestamp of the read message
    pub timestamp: i64,
    pub read_at: i64,
}

#[derive(Debug, Default)]
pub struct ReceiptTracker {
    deliveries: RwLock<Vec<DeliveryReceipt>>,
    reads: RwLock<Vec<ReadReceipt>>,
}

impl ReceiptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_delivery(&self, source: &str, source_device: u32, timestamp: i64) {
        info!("delivery receipt from {}.{} {}", source, source_device, timestamp);
        self.deliveries.write().await.push(DeliveryReceipt {
            source: source.to_string(),
            source_device,
            timestamp,
        });
    }

    pub async fn record_read(&self, sender: &str, timestamp: i64, read_at: i64) {
        info!("read receipt {} {}", sender, timestamp);
        self.reads.write().await.push(ReadReceipt {
            sender: sender.to_string(),
            timestamp,
            read_at,
        });
    }

    pub async fn deliveries(&self) -> Vec<DeliveryReceipt> {
        self.deliveries.read().await.clone()
    }

    pub async fn reads(&self) -> Vec<ReadReceipt> {
        self.reads.read().await.clone()
    }

    /// Delivery receipts for a sent message
    pub async fn deliveries_for(&self, timestamp: i64) -> Vec<DeliveryReceipt> {
        self.deliveries
            .read()
            .await
            .iter()
            .filter(|r| r.timestamp == timestamp)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicates_are_kept() {
        let tracker = ReceiptTracker::new();
        tracker.record_delivery("+1555", 1, 1000).await;
        tracker.record_delivery("+1555", 1, 1000).await;
        tracker.record_delivery("+1666", 2, 2000).await;

        assert_eq!(tracker.deliveries().await.len(), 3);
        assert_eq!(tracker.deliveries_for(1000).await.len(), 2);
    }

    #[tokio::test]
    async fn test_read_receipt_keeps_read_time() {
        let tracker = ReceiptTracker::new();
        tracker.record_read("+1555", 1000, 5000).await;

        let reads = tracker.reads().await;
        assert_eq!(
            reads,
            vec![ReadReceipt {
                sender: "+1555".to_string(),
                timestamp: 1000,
                read_at: 5000,
            }]
        );
    }
}
