//! Append-only audit log
//!
//! Every security-relevant session event lands here: login, logout, token
//! rotation, invalid refresh tokens, session expiry. Rows carry token
//! fingerprints, never tokens. Immutability is enforced in the database
//! itself with triggers that abort UPDATE and DELETE. Appends are
//! fire-and-forget; a failed audit write is logged and never fails the
//! request that caused it.

use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;

/// Categories of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventKind {
    LoginSuccess,
    Logout,
    TokenRefresh,
    InvalidRefreshToken,
    SessionExpired,
}

impl std::fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoginSuccess => write!(f, "auth.login.success"),
            Self::Logout => write!(f, "auth.logout"),
            Self::TokenRefresh => write!(f, "auth.token.refresh"),
            Self::InvalidRefreshToken => write!(f, "auth.refresh_token.invalid"),
            Self::SessionExpired => write!(f, "auth.session.expired"),
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, Default)]
pub struct AuditEvent {
    pub user_id: Option<i64>,
    pub refresh_token_fingerprint: Option<String>,
    pub access_token_fingerprint: Option<String>,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            ..Self::default()
        }
    }

    pub fn user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn refresh_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.refresh_token_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn access_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.access_token_fingerprint = Some(fingerprint.into());
        self
    }
}

/// Writer over the hub's `audit_log` table.
pub struct AuditLog {
    conn: libsql::Connection,
}

impl AuditLog {
    /// Open over the hub database, creating the table and its immutability
    /// triggers.
    pub async fn open(db: &libsql::Database) -> Result<Self> {
        let conn = db.connect()?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                user_id INTEGER,
                refresh_token_fingerprint TEXT,
                access_token_fingerprint TEXT,
                detail TEXT NOT NULL
            )
            "#,
            (),
        )
        .await?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON audit_log (timestamp)",
            (),
        )
        .await?;
        conn.execute(
            r#"
            CREATE TRIGGER IF NOT EXISTS audit_log_no_update
            BEFORE UPDATE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit records are immutable');
            END
            "#,
            (),
        )
        .await?;
        conn.execute(
            r#"
            CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
            BEFORE DELETE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit records are immutable');
            END
            "#,
            (),
        )
        .await?;

        Ok(Self { conn })
    }

    /// Append one record.
    pub async fn append(&self, kind: AuditEventKind, event: &AuditEvent) -> Result<()> {
        let user_id = event
            .user_id
            .map_or(libsql::Value::Null, libsql::Value::Integer);
        let refresh_fp = event
            .refresh_token_fingerprint
            .clone()
            .map_or(libsql::Value::Null, libsql::Value::Text);
        let access_fp = event
            .access_token_fingerprint
            .clone()
            .map_or(libsql::Value::Null, libsql::Value::Text);

        self.conn
            .execute(
                "INSERT INTO audit_log \
                 (timestamp, event_type, user_id, refresh_token_fingerprint, \
                  access_token_fingerprint, detail) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                libsql::params![
                    Utc::now().to_rfc3339(),
                    kind.to_string(),
                    user_id,
                    refresh_fp,
                    access_fp,
                    event.detail.clone(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Fire-and-forget append; failures are logged and swallowed.
    pub fn record(self: &Arc<Self>, kind: AuditEventKind, event: AuditEvent) {
        let log = self.clone();
        tokio::spawn(async move {
            if let Err(e) = log.append(kind, &event).await {
                tracing::warn!("audit append failed for {}: {}", kind, e);
            }
        });
    }

    /// Number of records with the given event type, for diagnostics.
    pub async fn count_of(&self, kind: AuditEventKind) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT count(*) FROM audit_log WHERE event_type = ?1",
                libsql::params![kind.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn log() -> AuditLog {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        AuditLog::open(&db).await.unwrap()
    }

    #[tokio::test]
    async fn appends_are_visible() {
        let log = log().await;
        log.append(
            AuditEventKind::LoginSuccess,
            &AuditEvent::new("login as admin")
                .user(1)
                .refresh_fingerprint("fp-1"),
        )
        .await
        .unwrap();
        assert_eq!(log.count_of(AuditEventKind::LoginSuccess).await.unwrap(), 1);
        assert_eq!(
            log.count_of(AuditEventKind::InvalidRefreshToken)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn records_cannot_be_rewritten() {
        let log = log().await;
        log.append(AuditEventKind::Logout, &AuditEvent::new("bye").user(2))
            .await
            .unwrap();

        assert!(log
            .conn
            .execute("UPDATE audit_log SET detail = 'tampered'", ())
            .await
            .is_err());
        assert!(log.conn.execute("DELETE FROM audit_log", ()).await.is_err());
    }

    #[tokio::test]
    async fn event_kind_names_are_stable() {
        assert_eq!(AuditEventKind::LoginSuccess.to_string(), "auth.login.success");
        assert_eq!(
            AuditEventKind::InvalidRefreshToken.to_string(),
            "auth.refresh_token.invalid"
        );
        assert_eq!(
            AuditEventKind::SessionExpired.to_string(),
            "auth.session.expired"
        );
    }
}
