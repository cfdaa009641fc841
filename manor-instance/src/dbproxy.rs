//! Host-side executor of the database proxy protocol
//!
//! The guest sees a full relational interface without ever holding a file
//! handle: every call arrives as one JSON envelope (see
//! [`manor_wire::dbproxy`]) and is executed here against the instance
//! database. Transactions and prepared statements live in host-owned
//! registries keyed by opaque ids.
//!
//! Transactions come in two flavours. Guest-opened transactions
//! (`begin_tx`) may be committed or rolled back by the guest. Host-opened
//! transactions wrap event dispatch; the guest can read and write through
//! them but the publish path alone decides their fate.

use std::collections::HashMap;

use manor_wire::{DbCommand, DbRequest, DbResponse};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Who controls a registered transaction's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxOwner {
    Guest,
    Host,
}

struct TxEntry {
    tx: libsql::Transaction,
    owner: TxOwner,
}

#[derive(Default)]
struct Registries {
    txs: HashMap<u64, TxEntry>,
    stmts: HashMap<u64, String>,
    next_tx_id: u64,
    next_stmt_id: u64,
}

/// The proxy executor. One per instance database.
pub struct DbProxy {
    db: libsql::Database,
    conn: libsql::Connection,
    registries: Mutex<Registries>,
}

impl DbProxy {
    /// Wrap an opened database.
    pub fn new(db: libsql::Database) -> Result<Self> {
        let conn = db.connect()?;
        Ok(Self {
            db,
            conn,
            registries: Mutex::new(Registries::default()),
        })
    }

    /// The shared autocommit connection, for boot-time migration and reads
    /// outside any transaction.
    pub fn connection(&self) -> &libsql::Connection {
        &self.conn
    }

    /// Handle one raw envelope from the guest. Never fails; protocol and
    /// statement errors travel back inside the envelope.
    pub async fn handle_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        let response = match serde_json::from_slice::<DbRequest>(bytes) {
            Ok(request) => self.handle(request).await,
            Err(e) => DbResponse::error(format!("malformed request: {}", e)),
        };
        serde_json::to_vec(&response)
            .unwrap_or_else(|_| b"{\"error\":\"response encoding failed\"}".to_vec())
    }

    /// Handle one decoded request from the guest.
    pub async fn handle(&self, request: DbRequest) -> DbResponse {
        match request.command {
            DbCommand::Prepare => self.prepare(request).await,
            DbCommand::Exec => self.exec(request).await,
            DbCommand::Query => self.query(request).await,
            DbCommand::BeginTx => self.begin_guest_tx().await,
            DbCommand::Commit => self.finish_guest_tx(request.tx_id, true).await,
            DbCommand::Rollback => self.finish_guest_tx(request.tx_id, false).await,
            DbCommand::CloseStmt => self.close_stmt(request.stmt_id).await,
            DbCommand::CloseConn => self.close_conn().await,
        }
    }

    async fn prepare(&self, request: DbRequest) -> DbResponse {
        let Some(sql) = request.sql else {
            return DbResponse::error("prepare requires sql");
        };
        let mut reg = self.registries.lock().await;
        reg.next_stmt_id += 1;
        let stmt_id = reg.next_stmt_id;
        reg.stmts.insert(stmt_id, sql);
        DbResponse::prepared(stmt_id)
    }

    async fn resolve_sql(&self, request: &DbRequest) -> std::result::Result<String, DbResponse> {
        if let Some(ref sql) = request.sql {
            return Ok(sql.clone());
        }
        if let Some(stmt_id) = request.stmt_id {
            let reg = self.registries.lock().await;
            return match reg.stmts.get(&stmt_id) {
                Some(sql) => Ok(sql.clone()),
                None => Err(DbResponse::error(format!(
                    "unknown statement id {}",
                    stmt_id
                ))),
            };
        }
        Err(DbResponse::error("exec/query requires sql or stmt_id"))
    }

    async fn exec(&self, request: DbRequest) -> DbResponse {
        let sql = match self.resolve_sql(&request).await {
            Ok(sql) => sql,
            Err(resp) => return resp,
        };
        let args = match convert_args(&request.args) {
            Ok(args) => args,
            Err(msg) => return DbResponse::error(msg),
        };

        if let Some(tx_id) = request.tx_id {
            let reg = self.registries.lock().await;
            let Some(entry) = reg.txs.get(&tx_id) else {
                return DbResponse::error(format!("unknown transaction id {}", tx_id));
            };
            match entry.tx.execute(&sql, args).await {
                Ok(affected) => DbResponse::executed(entry.tx.last_insert_rowid(), affected),
                Err(e) => DbResponse::error(e.to_string()),
            }
        } else {
            match self.conn.execute(&sql, args).await {
                Ok(affected) => DbResponse::executed(self.conn.last_insert_rowid(), affected),
                Err(e) => DbResponse::error(e.to_string()),
            }
        }
    }

    async fn query(&self, request: DbRequest) -> DbResponse {
        let sql = match self.resolve_sql(&request).await {
            Ok(sql) => sql,
            Err(resp) => return resp,
        };
        let args = match convert_args(&request.args) {
            Ok(args) => args,
            Err(msg) => return DbResponse::error(msg),
        };

        let rows = if let Some(tx_id) = request.tx_id {
            let reg = self.registries.lock().await;
            let Some(entry) = reg.txs.get(&tx_id) else {
                return DbResponse::error(format!("unknown transaction id {}", tx_id));
            };
            entry.tx.query(&sql, args).await
        } else {
            self.conn.query(&sql, args).await
        };

        match rows {
            Ok(rows) => match collect_rows(rows).await {
                Ok((columns, rows)) => DbResponse::queried(columns, rows),
                Err(msg) => DbResponse::error(msg),
            },
            Err(e) => DbResponse::error(e.to_string()),
        }
    }

    async fn begin_guest_tx(&self) -> DbResponse {
        match self.open_tx(TxOwner::Guest).await {
            Ok(tx_id) => DbResponse::transaction(tx_id),
            Err(e) => DbResponse::error(e.to_string()),
        }
    }

    async fn finish_guest_tx(&self, tx_id: Option<u64>, commit: bool) -> DbResponse {
        let Some(tx_id) = tx_id else {
            return DbResponse::error("commit/rollback requires tx_id");
        };
        let entry = {
            let mut reg = self.registries.lock().await;
            match reg.txs.remove(&tx_id) {
                None => return DbResponse::error(format!("unknown transaction id {}", tx_id)),
                Some(entry) if entry.owner == TxOwner::Host => {
                    reg.txs.insert(tx_id, entry);
                    return DbResponse::error("transaction is read-only for the caller");
                }
                Some(entry) => entry,
            }
        };
        let result = if commit {
            entry.tx.commit().await
        } else {
            entry.tx.rollback().await
        };
        match result {
            Ok(()) => DbResponse::empty(),
            Err(e) => DbResponse::error(e.to_string()),
        }
    }

    async fn close_stmt(&self, stmt_id: Option<u64>) -> DbResponse {
        let Some(stmt_id) = stmt_id else {
            return DbResponse::error("close_stmt requires stmt_id");
        };
        let mut reg = self.registries.lock().await;
        reg.stmts.remove(&stmt_id);
        DbResponse::empty()
    }

    /// Release every guest-owned handle. Host-owned transactions (event
    /// dispatch) are untouched.
    async fn close_conn(&self) -> DbResponse {
        let guest_txs: Vec<TxEntry> = {
            let mut reg = self.registries.lock().await;
            reg.stmts.clear();
            let ids: Vec<u64> = reg
                .txs
                .iter()
                .filter(|(_, e)| e.owner == TxOwner::Guest)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| reg.txs.remove(&id))
                .collect()
        };
        for entry in guest_txs {
            if let Err(e) = entry.tx.rollback().await {
                tracing::warn!("rollback on close_conn failed: {}", e);
            }
        }
        DbResponse::empty()
    }

    async fn open_tx(&self, owner: TxOwner) -> Result<u64> {
        // Each transaction gets its own connection so autocommit statements
        // on the shared connection never join it.
        let conn = self.db.connect()?;
        let tx = conn.transaction().await?;
        let mut reg = self.registries.lock().await;
        reg.next_tx_id += 1;
        let tx_id = reg.next_tx_id;
        reg.txs.insert(tx_id, TxEntry { tx, owner });
        Ok(tx_id)
    }

    /// Open a transaction owned by the host (event dispatch). The returned
    /// id may be handed to guest handlers; they cannot commit it.
    pub async fn begin_host_tx(&self) -> Result<u64> {
        self.open_tx(TxOwner::Host).await
    }

    /// Commit or roll back a host-owned transaction.
    pub async fn finish_host_tx(&self, tx_id: u64, commit: bool) -> Result<()> {
        let entry = {
            let mut reg = self.registries.lock().await;
            reg.txs
                .remove(&tx_id)
                .ok_or_else(|| Error::Internal(format!("unknown transaction id {}", tx_id)))?
        };
        if commit {
            entry.tx.commit().await?;
        } else {
            entry.tx.rollback().await?;
        }
        Ok(())
    }

    /// Execute a statement inside a registered transaction. Used by the
    /// publish path and native event handlers.
    pub async fn tx_execute(
        &self,
        tx_id: u64,
        sql: &str,
        args: Vec<libsql::Value>,
    ) -> Result<(i64, u64)> {
        let reg = self.registries.lock().await;
        let entry = reg
            .txs
            .get(&tx_id)
            .ok_or_else(|| Error::Internal(format!("unknown transaction id {}", tx_id)))?;
        let affected = entry.tx.execute(sql, args).await?;
        Ok((entry.tx.last_insert_rowid(), affected))
    }

    /// Run a query inside a registered transaction.
    pub async fn tx_query(
        &self,
        tx_id: u64,
        sql: &str,
        args: Vec<libsql::Value>,
    ) -> Result<Vec<Vec<libsql::Value>>> {
        let reg = self.registries.lock().await;
        let entry = reg
            .txs
            .get(&tx_id)
            .ok_or_else(|| Error::Internal(format!("unknown transaction id {}", tx_id)))?;
        let mut rows = entry.tx.query(sql, args).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let mut values = Vec::with_capacity(rows.column_count() as usize);
            for i in 0..rows.column_count() {
                values.push(row.get_value(i)?);
            }
            out.push(values);
        }
        Ok(out)
    }
}

fn convert_args(args: &[JsonValue]) -> std::result::Result<Vec<libsql::Value>, String> {
    args.iter().map(json_to_value).collect()
}

fn json_to_value(v: &JsonValue) -> std::result::Result<libsql::Value, String> {
    match v {
        JsonValue::Null => Ok(libsql::Value::Null),
        JsonValue::Bool(b) => Ok(libsql::Value::Integer(i64::from(*b))),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(libsql::Value::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(libsql::Value::Real(f))
            } else {
                Err(format!("unrepresentable number: {}", n))
            }
        }
        JsonValue::String(s) => Ok(libsql::Value::Text(s.clone())),
        other => Err(format!("unsupported argument type: {}", other)),
    }
}

fn value_to_json(v: libsql::Value) -> JsonValue {
    match v {
        libsql::Value::Null => JsonValue::Null,
        libsql::Value::Integer(i) => JsonValue::from(i),
        libsql::Value::Real(f) => JsonValue::from(f),
        libsql::Value::Text(s) => JsonValue::from(s),
        libsql::Value::Blob(b) => JsonValue::from(manor_wire::dbproxy::encode_blob(&b)),
    }
}

async fn collect_rows(
    mut rows: libsql::Rows,
) -> std::result::Result<(Vec<String>, Vec<Vec<JsonValue>>), String> {
    let column_count = rows.column_count();
    let mut columns = Vec::with_capacity(column_count as usize);
    for i in 0..column_count {
        columns.push(rows.column_name(i).unwrap_or_default().to_string());
    }

    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => {
                let mut values = Vec::with_capacity(column_count as usize);
                for i in 0..column_count {
                    let value = row.get_value(i).map_err(|e| e.to_string())?;
                    values.push(value_to_json(value));
                }
                out.push(values);
            }
            Ok(None) => break,
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok((columns, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    async fn proxy() -> DbProxy {
        let db = open_memory_database().await.unwrap();
        let proxy = DbProxy::new(db).unwrap();
        proxy
            .connection()
            .execute(
                "CREATE TABLE notes (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT, data BLOB)",
                (),
            )
            .await
            .unwrap();
        proxy
    }

    fn req(command: DbCommand, sql: &str, args: Vec<JsonValue>) -> DbRequest {
        DbRequest {
            command,
            sql: Some(sql.to_string()),
            args,
            stmt_id: None,
            tx_id: None,
        }
    }

    #[tokio::test]
    async fn exec_reports_insert_id_and_affected_rows() {
        let proxy = proxy().await;
        let resp = proxy
            .handle(req(
                DbCommand::Exec,
                "INSERT INTO notes (body) VALUES (?1)",
                vec![JsonValue::from("hello")],
            ))
            .await;
        assert!(!resp.is_error(), "{:?}", resp.error);
        assert_eq!(resp.last_insert_id, Some(1));
        assert_eq!(resp.rows_affected, Some(1));
    }

    #[tokio::test]
    async fn query_returns_columns_and_rows() {
        let proxy = proxy().await;
        proxy
            .handle(req(
                DbCommand::Exec,
                "INSERT INTO notes (body) VALUES ('a'), ('b')",
                vec![],
            ))
            .await;
        let resp = proxy
            .handle(req(
                DbCommand::Query,
                "SELECT id, body FROM notes ORDER BY id",
                vec![],
            ))
            .await;
        assert_eq!(
            resp.columns,
            Some(vec!["id".to_string(), "body".to_string()])
        );
        let rows = resp.rows.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], JsonValue::from("a"));
    }

    #[tokio::test]
    async fn blobs_come_back_base64_encoded() {
        let proxy = proxy().await;
        proxy
            .connection()
            .execute("INSERT INTO notes (body, data) VALUES ('x', X'00FF')", ())
            .await
            .unwrap();
        let resp = proxy
            .handle(req(DbCommand::Query, "SELECT data FROM notes", vec![]))
            .await;
        let rows = resp.rows.unwrap();
        assert_eq!(
            rows[0][0],
            JsonValue::from(manor_wire::dbproxy::encode_blob(&[0x00, 0xFF]))
        );
    }

    #[tokio::test]
    async fn statement_errors_travel_in_the_envelope() {
        let proxy = proxy().await;
        let resp = proxy
            .handle(req(DbCommand::Query, "SELECT * FROM missing_v1", vec![]))
            .await;
        assert!(resp.is_error());
    }

    #[tokio::test]
    async fn guest_transaction_commit_persists() {
        let proxy = proxy().await;
        let begin = proxy.handle(DbRequest::command(DbCommand::BeginTx)).await;
        let tx_id = begin.tx_id.unwrap();

        let mut insert = req(
            DbCommand::Exec,
            "INSERT INTO notes (body) VALUES ('tx')",
            vec![],
        );
        insert.tx_id = Some(tx_id);
        assert!(!proxy.handle(insert).await.is_error());

        let mut commit = DbRequest::command(DbCommand::Commit);
        commit.tx_id = Some(tx_id);
        assert!(!proxy.handle(commit).await.is_error());

        let resp = proxy
            .handle(req(DbCommand::Query, "SELECT count(*) FROM notes", vec![]))
            .await;
        assert_eq!(resp.rows.unwrap()[0][0], JsonValue::from(1));
    }

    #[tokio::test]
    async fn guest_rollback_discards_writes() {
        let proxy = proxy().await;
        let begin = proxy.handle(DbRequest::command(DbCommand::BeginTx)).await;
        let tx_id = begin.tx_id.unwrap();

        let mut insert = req(
            DbCommand::Exec,
            "INSERT INTO notes (body) VALUES ('gone')",
            vec![],
        );
        insert.tx_id = Some(tx_id);
        proxy.handle(insert).await;

        let mut rollback = DbRequest::command(DbCommand::Rollback);
        rollback.tx_id = Some(tx_id);
        assert!(!proxy.handle(rollback).await.is_error());

        let resp = proxy
            .handle(req(DbCommand::Query, "SELECT count(*) FROM notes", vec![]))
            .await;
        assert_eq!(resp.rows.unwrap()[0][0], JsonValue::from(0));
    }

    #[tokio::test]
    async fn host_transactions_are_read_only_for_the_guest() {
        let proxy = proxy().await;
        let tx_id = proxy.begin_host_tx().await.unwrap();

        let mut commit = DbRequest::command(DbCommand::Commit);
        commit.tx_id = Some(tx_id);
        let resp = proxy.handle(commit).await;
        assert!(resp.is_error());
        assert!(resp.error.unwrap().contains("read-only"));

        // The guest may still write through it.
        let mut insert = req(
            DbCommand::Exec,
            "INSERT INTO notes (body) VALUES ('handler write')",
            vec![],
        );
        insert.tx_id = Some(tx_id);
        assert!(!proxy.handle(insert).await.is_error());

        proxy.finish_host_tx(tx_id, true).await.unwrap();
        let resp = proxy
            .handle(req(DbCommand::Query, "SELECT count(*) FROM notes", vec![]))
            .await;
        assert_eq!(resp.rows.unwrap()[0][0], JsonValue::from(1));
    }

    #[tokio::test]
    async fn prepared_statements_resolve_by_id() {
        let proxy = proxy().await;
        let prep = proxy
            .handle(req(
                DbCommand::Prepare,
                "INSERT INTO notes (body) VALUES (?1)",
                vec![],
            ))
            .await;
        let stmt_id = prep.stmt_id.unwrap();

        let exec = DbRequest {
            command: DbCommand::Exec,
            sql: None,
            args: vec![JsonValue::from("via stmt")],
            stmt_id: Some(stmt_id),
            tx_id: None,
        };
        assert!(!proxy.handle(exec).await.is_error());

        let close = DbRequest {
            command: DbCommand::CloseStmt,
            sql: None,
            args: vec![],
            stmt_id: Some(stmt_id),
            tx_id: None,
        };
        assert!(!proxy.handle(close).await.is_error());

        let exec = DbRequest {
            command: DbCommand::Exec,
            sql: None,
            args: vec![JsonValue::from("stale")],
            stmt_id: Some(stmt_id),
            tx_id: None,
        };
        assert!(proxy.handle(exec).await.is_error());
    }

    #[tokio::test]
    async fn close_conn_releases_guest_handles_only() {
        let proxy = proxy().await;
        let host_tx = proxy.begin_host_tx().await.unwrap();
        let begin = proxy.handle(DbRequest::command(DbCommand::BeginTx)).await;
        let guest_tx = begin.tx_id.unwrap();

        assert!(!proxy
            .handle(DbRequest::command(DbCommand::CloseConn))
            .await
            .is_error());

        // The guest transaction is gone.
        let mut commit = DbRequest::command(DbCommand::Commit);
        commit.tx_id = Some(guest_tx);
        assert!(proxy.handle(commit).await.is_error());

        // The host transaction survived.
        proxy.finish_host_tx(host_tx, false).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_bytes_produce_an_error_envelope() {
        let proxy = proxy().await;
        let bytes = proxy.handle_bytes(b"not json").await;
        let resp: DbResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(resp.is_error());
    }
}
