use schema::DEVICE_EVENT_TYPE;
use store::DedupStore;
use tracing::{debug, warn};

use crate::{IngestError, api::DevicePush, records::device_record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueReport {
    pub records_queued: usize,
    pub already_queued: usize,
    pub skipped: usize,
}

/// Stages raw device records in the quarantine queue.
///
/// Only the queue is written; branch, employee and sync bookkeeping are left
/// to promotion.
pub fn accept_device_push(
    store: &dyn DedupStore,
    push: DevicePush,
) -> Result<QueueReport, IngestError> {
    if push.event_type.as_deref() != Some(DEVICE_EVENT_TYPE) {
        return Err(IngestError::Rejected(format!(
            "unsupported event_type: expected \"{DEVICE_EVENT_TYPE}\""
        )));
    }

    let mut report = QueueReport::default();
    for (index, raw) in push.records.iter().enumerate() {
        let Some(record) = device_record(&push.branch_id, raw) else {
            warn!(index, "skipping device record that is not an object");
            report.skipped += 1;
            continue;
        };
        match store.enqueue_quarantined(record)? {
            Some(queue_id) => {
                debug!(queue_id, "device record queued");
                report.records_queued += 1;
            }
            None => report.already_queued += 1,
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use store::InMemoryStore;

    fn push(event_type: Option<&str>, records: Vec<serde_json::Value>) -> DevicePush {
        DevicePush {
            event_type: event_type.map(str::to_string),
            branch_id: "3".to_string(),
            records,
        }
    }

    #[test]
    fn accept_device_push_rejects_other_event_types_without_side_effects() {
        let store = InMemoryStore::new();
        for event_type in [None, Some("heartbeat"), Some("Attendance")] {
            let err = accept_device_push(
                &store,
                push(event_type, vec![json!({"event_id": "d1", "user_id": "1"})]),
            )
            .unwrap_err();
            assert!(matches!(err, IngestError::Rejected(_)));
        }
        assert_eq!(store.queue_depth().unwrap().pending_attendance, 0);
    }

    #[test]
    fn accept_device_push_dedups_by_non_empty_event_id_only() {
        let store = InMemoryStore::new();
        let report = accept_device_push(
            &store,
            push(
                Some("attendance"),
                vec![
                    json!({"event_id": "d1", "user_id": "1", "timestamp": "2024-01-01 08:00:00"}),
                    json!({"event_id": "d1", "user_id": "1", "timestamp": "2024-01-01 08:00:00"}),
                    json!({"event_id": "", "user_id": "2", "timestamp": "2024-01-01 08:01:00"}),
                    json!({"event_id": "", "user_id": "3", "timestamp": "2024-01-01 08:02:00"}),
                    json!("not a record"),
                ],
            ),
        )
        .unwrap();

        assert_eq!(
            report,
            QueueReport {
                records_queued: 3,
                already_queued: 1,
                skipped: 1,
            }
        );
        assert_eq!(store.queue_depth().unwrap().pending_attendance, 3);
    }

    #[test]
    fn accept_device_push_leaves_canonical_bookkeeping_alone() {
        let store = InMemoryStore::new();
        accept_device_push(
            &store,
            push(
                Some("attendance"),
                vec![json!({"event_id": "d1", "user_id": "1", "timestamp": "2024-01-01"})],
            ),
        )
        .unwrap();

        assert_eq!(store.events_len().unwrap(), 0);
        assert_eq!(store.branch(3).unwrap(), None);
        assert_eq!(store.sync_status(3).unwrap(), None);
    }
}
