//! Database proxy wire format
//!
//! A guest module never touches a database file. Instead it sends one JSON
//! object per call over the sandbox ABI and receives one JSON object back.
//! The host executes the statement against the instance database and relays
//! results. Errors travel inside the same envelope as `{"error": "..."}` so
//! the guest can distinguish a failed statement from a broken channel.
//!
//! Value encoding contract (both directions):
//! - integers, floats, booleans and strings are native JSON values
//! - blobs are base64 strings (standard alphabet, padded)
//! - timestamps are RFC 3339 text with nanosecond precision
//!
//! Guest-side struct binding is a contract, not code in this crate: columns
//! bind to fields by lowercased name, a `db` field tag overrides the name,
//! base64 decodes into byte fields and RFC 3339 parses into time fields on a
//! best-effort basis.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Commands a guest may issue over the proxy channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbCommand {
    /// Prepare a statement for repeated execution; answers `{stmt_id}`.
    Prepare,
    /// Execute a statement; answers `{last_insert_id, rows_affected}`.
    Exec,
    /// Run a query; answers `{columns, rows}`.
    Query,
    /// Open an explicit transaction; answers `{tx_id}`.
    BeginTx,
    /// Commit an explicit transaction.
    Commit,
    /// Roll back an explicit transaction.
    Rollback,
    /// Release a prepared statement.
    CloseStmt,
    /// Release every handle owned by the caller.
    CloseConn,
}

impl std::fmt::Display for DbCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Exec => write!(f, "exec"),
            Self::Query => write!(f, "query"),
            Self::BeginTx => write!(f, "begin_tx"),
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
            Self::CloseStmt => write!(f, "close_stmt"),
            Self::CloseConn => write!(f, "close_conn"),
        }
    }
}

/// One proxied database call.
///
/// `sql` and `args` accompany `prepare`/`exec`/`query`; `stmt_id` selects a
/// previously prepared statement instead of `sql`; `tx_id` scopes the call
/// to an open transaction. Event handlers receive a `tx_id` they may read
/// and write through, but not commit or roll back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbRequest {
    pub command: DbCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stmt_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<u64>,
}

impl DbRequest {
    /// Shorthand for a bare command with no payload.
    pub fn command(command: DbCommand) -> Self {
        Self {
            command,
            sql: None,
            args: Vec::new(),
            stmt_id: None,
            tx_id: None,
        }
    }
}

/// The answer to a [`DbRequest`].
///
/// Exactly the fields relevant to the issued command are populated; a
/// populated `error` means the call failed and every other field is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stmt_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<serde_json::Value>>>,
}

impl DbResponse {
    /// An empty success envelope (commit, rollback, close).
    pub fn empty() -> Self {
        Self::default()
    }

    /// A failure envelope carrying a human-readable message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Answer to `prepare`.
    pub fn prepared(stmt_id: u64) -> Self {
        Self {
            stmt_id: Some(stmt_id),
            ..Self::default()
        }
    }

    /// Answer to `begin_tx`.
    pub fn transaction(tx_id: u64) -> Self {
        Self {
            tx_id: Some(tx_id),
            ..Self::default()
        }
    }

    /// Answer to `exec`.
    pub fn executed(last_insert_id: i64, rows_affected: u64) -> Self {
        Self {
            last_insert_id: Some(last_insert_id),
            rows_affected: Some(rows_affected),
            ..Self::default()
        }
    }

    /// Answer to `query`.
    pub fn queried(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self {
            columns: Some(columns),
            rows: Some(rows),
            ..Self::default()
        }
    }

    /// Whether this envelope reports a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Encode a blob column for the wire.
pub fn encode_blob(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a base64 blob from the wire.
pub fn decode_blob(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(encoded)
}

/// Encode a timestamp column for the wire (RFC 3339, nanoseconds, UTC).
pub fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a wire timestamp back into UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn command_names_are_snake_case_on_the_wire() {
        let json = serde_json::to_string(&DbCommand::BeginTx).unwrap();
        assert_eq!(json, "\"begin_tx\"");
        let parsed: DbCommand = serde_json::from_str("\"close_conn\"").unwrap();
        assert_eq!(parsed, DbCommand::CloseConn);
    }

    #[test]
    fn request_omits_absent_fields() {
        let req = DbRequest::command(DbCommand::Commit);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"command": "commit"}));
    }

    #[test]
    fn request_round_trips_with_args() {
        let req = DbRequest {
            command: DbCommand::Query,
            sql: Some("SELECT id FROM users_v1 WHERE username = ?1".into()),
            args: vec![serde_json::json!("admin")],
            stmt_id: None,
            tx_id: Some(7),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: DbRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.command, DbCommand::Query);
        assert_eq!(back.tx_id, Some(7));
        assert_eq!(back.args.len(), 1);
    }

    #[test]
    fn error_envelope_shape() {
        let resp = DbResponse::error("no such table: missing_v1");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"error": "no such table: missing_v1"})
        );
        assert!(resp.is_error());
    }

    #[test]
    fn exec_envelope_shape() {
        let resp = DbResponse::executed(42, 1);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"last_insert_id": 42, "rows_affected": 1})
        );
    }

    #[test]
    fn blob_codec_round_trips() {
        let bytes = vec![0u8, 1, 2, 254, 255];
        let encoded = encode_blob(&bytes);
        assert_eq!(decode_blob(&encoded).unwrap(), bytes);
    }

    #[test]
    fn timestamp_codec_keeps_nanoseconds() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 45).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let text = encode_timestamp(ts);
        assert!(text.ends_with('Z'));
        assert_eq!(parse_timestamp(&text), Some(ts));
    }

    #[test]
    fn timestamp_parse_rejects_garbage() {
        assert!(parse_timestamp("yesterday at noon").is_none());
    }
}
