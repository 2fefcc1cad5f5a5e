use store::StoreError;

use crate::IngestError;

pub(super) fn map_ingest_error(error: &IngestError) -> (u16, String) {
    match error {
        IngestError::Validation(err) => (400, format!("validation error: {err}")),
        IngestError::Rejected(message) => (400, message.clone()),
        IngestError::Store(StoreError::Validation(err)) => {
            (400, format!("validation error: {err}"))
        }
        IngestError::Store(StoreError::Io(message) | StoreError::Parse(message)) => {
            (500, format!("internal persistence error: {message}"))
        }
        IngestError::Store(StoreError::Poisoned) => {
            (500, "internal persistence error: store unavailable".to_string())
        }
    }
}
