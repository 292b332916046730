//! Encoding and decoding helpers between document types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 strings. Field maps are stored as compact
//! JSON objects whose values carry their own type tag.

use carpolly_core::document::{DocPath, Document, FieldValue, Fields};
use chrono::{DateTime, Utc};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Fields ──────────────────────────────────────────────────────────────────

pub fn encode_fields(fields: &Fields) -> Result<String> {
  Ok(serde_json::to_string(fields)?)
}

pub fn decode_fields(s: &str) -> Result<Fields> { Ok(serde_json::from_str(s)?) }

/// Replace every server-timestamp sentinel with `now`.
pub fn resolve_server_timestamps(fields: Fields, now: DateTime<Utc>) -> Fields {
  fields
    .into_iter()
    .map(|(name, value)| {
      if value.is_server_timestamp() {
        (name, FieldValue::Timestamp(now))
      } else {
        (name, value)
      }
    })
    .collect()
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw strings read directly from a `documents` row.
pub struct RawDocument {
  pub path:        String,
  pub fields_json: String,
  pub create_time: String,
  pub update_time: String,
}

impl RawDocument {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      path:        row.get(0)?,
      fields_json: row.get(1)?,
      create_time: row.get(2)?,
      update_time: row.get(3)?,
    })
  }

  pub fn into_document(self) -> Result<Document> {
    Ok(Document {
      path:        DocPath::parse(&self.path)?,
      fields:      decode_fields(&self.fields_json)?,
      create_time: decode_dt(&self.create_time)?,
      update_time: decode_dt(&self.update_time)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn server_timestamps_resolve_to_now() {
    let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let mut fields = Fields::new();
    fields.insert("name".into(), "Alex".into());
    fields.insert("lastUpdated".into(), FieldValue::server_timestamp());

    let resolved = resolve_server_timestamps(fields, now);
    assert_eq!(resolved["lastUpdated"], FieldValue::Timestamp(now));
    assert_eq!(resolved["name"], FieldValue::from("Alex"));
  }

  #[test]
  fn fields_survive_the_column_encoding() {
    let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
    let mut fields = Fields::new();
    fields.insert("spots".into(), 3u32.into());
    fields.insert("comments".into(), FieldValue::Null);
    fields.insert("created".into(), at.into());

    let decoded = decode_fields(&encode_fields(&fields).unwrap()).unwrap();
    assert_eq!(decoded, fields);
    assert_eq!(decode_dt(&encode_dt(at)).unwrap(), at);
  }
}
