//! Versioned on-disk encoding of job records.
//!
//! Records are stored as a JSON envelope:
//!
//! ```json
//! {"version": 1, "record": {"job_id": "...", "job_type": "echo", ...}}
//! ```
//!
//! The envelope version is checked before the record is touched, so a newer
//! writer can never be half-understood by an older reader. Additive fields
//! stay on the same version and rely on serde defaults.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{QueueError, QueueResult};
use crate::job::JobRecord;

/// Current record schema version.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    record: &'a JobRecord,
}

#[derive(Deserialize)]
struct EnvelopeOwned {
    version: u32,
    record: JsonValue,
}

/// Encode a record with the current schema version.
pub fn encode(record: &JobRecord) -> QueueResult<Vec<u8>> {
    serde_json::to_vec(&EnvelopeRef {
        version: SCHEMA_VERSION,
        record,
    })
    .map_err(|e| QueueError::codec(format!("encode {}: {e}", record.job_id)))
}

/// Decode a record, rejecting versions this build does not understand.
pub fn decode(bytes: &[u8]) -> QueueResult<JobRecord> {
    let envelope: EnvelopeOwned = serde_json::from_slice(bytes)
        .map_err(|e| QueueError::codec(format!("malformed envelope: {e}")))?;

    if envelope.version == 0 || envelope.version > SCHEMA_VERSION {
        return Err(QueueError::codec(format!(
            "unsupported record schema version {} (this build reads up to {SCHEMA_VERSION})",
            envelope.version
        )));
    }

    serde_json::from_value(envelope.record)
        .map_err(|e| QueueError::codec(format!("malformed record: {e}")))
}
