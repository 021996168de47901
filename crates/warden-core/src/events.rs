//! Event records and their JSON rendering.

use crate::lbvs::{CodecError, LbvsReader, LbvsWriter, Value};
use crate::protocol::{EventField, SysmonEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map};

/// Accepts finished event records for delivery.
pub trait EventSink: Send + Sync {
    fn submit(&self, record: Vec<u8>);
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn submit(&self, record: Vec<u8>) {
        self.records.lock().push(record);
    }
}

/// Starts a record with the fields every event carries.
pub fn begin(event: SysmonEvent, tick_ms: u64, pid: u32) -> LbvsWriter {
    let mut w = LbvsWriter::new();
    w.write_u32(EventField::RawEventId, event.raw());
    w.write_u64(EventField::TickTime, tick_ms);
    w.write_u32(EventField::ProcessPid, pid);
    w
}

/// Event id of a record, if it has one.
pub fn event_id(record: &[u8]) -> Result<Option<SysmonEvent>, CodecError> {
    for field in LbvsReader::new(record)?.fields() {
        let field = field?;
        if field.id == u16::from(EventField::RawEventId) {
            return Ok(SysmonEvent::from_raw(field.as_u32()?));
        }
    }
    Ok(None)
}

fn field_name(id: u16) -> String {
    EventField::from_raw(u32::from(id))
        .map(|f| format!("{f:?}"))
        .unwrap_or_else(|| format!("field_{id}"))
}

/// Renders a record as a JSON object keyed by field name. Repeated ids
/// become arrays; the event id is also rendered by name under `event`.
pub fn to_json(record: &[u8]) -> Result<serde_json::Value, CodecError> {
    let reader = LbvsReader::new(record)?;
    let mut out = Map::new();
    for field in reader.fields() {
        let field = field?;
        let value = match field.value {
            Value::Null | Value::Group => serde_json::Value::Null,
            Value::Str(_) | Value::WStr(_) => json!(field.as_string()?),
            Value::Stream(bytes) => json!(hex::encode(bytes)),
            Value::Bool(v) => json!(v),
            Value::U32(v) => json!(v),
            Value::U64(v) => json!(v),
        };
        if field.id == u16::from(EventField::RawEventId) {
            if let Some(event) = SysmonEvent::from_raw(field.as_u32()?) {
                out.insert("event".into(), json!(format!("{event:?}")));
            }
        }
        let name = field_name(field.id);
        if let (Value::U64(ms), Some(EventField::ProcessCreationTime | EventField::ProcessDeletionTime)) =
            (field.value, EventField::from_raw(u32::from(field.id)))
        {
            if let Some(at) = i64::try_from(ms).ok().and_then(DateTime::<Utc>::from_timestamp_millis) {
                out.insert(format!("{name}Utc"), json!(at.to_rfc3339()));
            }
        }
        match out.get_mut(&name) {
            Some(serde_json::Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = json!([first, value]);
            }
            None => {
                out.insert(name, value);
            }
        }
    }
    Ok(serde_json::Value::Object(out))
}
