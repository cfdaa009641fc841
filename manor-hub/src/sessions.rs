//! Session and access-token management
//!
//! Refresh tokens are high-entropy opaque strings stored server-side with a
//! fingerprint (hash) safe to write into audit records. Rotation inserts a
//! NEW session row for the new token and shortens the old row's expiry to a
//! small grace window, so a concurrent in-flight request using the old
//! token still succeeds briefly; both changes commit in one transaction.
//!
//! Access tokens never touch disk: they live in a concurrent in-memory map
//! and die with the process. Losing them only restarts the refresh cycle.
//!
//! The fingerprint function is injected at construction so the audit layer
//! and this one stay acyclic.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;

use crate::error::{Error, Result};

/// Hashes a token into its audit-safe fingerprint.
pub type FingerprintFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// One refresh-token session row.
#[derive(Debug, Clone)]
pub struct Session {
    pub refresh_token: String,
    pub fingerprint: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// One in-memory access token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub user_id: i64,
    pub application_id: String,
    pub refresh_token_fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

/// Refresh-token store plus the in-memory access-token map.
pub struct SessionManager {
    db: libsql::Database,
    conn: libsql::Connection,
    fingerprint: FingerprintFn,
    tokens: DashMap<String, AccessToken>,
}

impl SessionManager {
    /// Open over the hub database and run migrations.
    pub async fn open(db: libsql::Database, fingerprint: FingerprintFn) -> Result<Self> {
        let conn = db.connect()?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                refresh_token TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
            (),
        )
        .await?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions (user_id)",
            (),
        )
        .await?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_fingerprint ON sessions (fingerprint)",
            (),
        )
        .await?;

        Ok(Self {
            db,
            conn,
            fingerprint,
            tokens: DashMap::new(),
        })
    }

    /// Fingerprint of any token, via the injected hash.
    pub fn fingerprint_of(&self, token: &str) -> String {
        (self.fingerprint)(token)
    }

    /// Start a session for a fresh login.
    pub async fn create_session(&self, user_id: i64, window: Duration) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            refresh_token: generate_refresh_token(),
            fingerprint: String::new(),
            user_id,
            created_at: now,
            expires_at: expiry_after(now, window)?,
        };
        let session = Session {
            fingerprint: self.fingerprint_of(&session.refresh_token),
            ..session
        };
        self.insert_session(&self.conn, &session).await?;
        Ok(session)
    }

    /// Resolve a refresh token. Expired rows are returned too; callers
    /// check expiry explicitly so they can distinguish "expired" from
    /// "never existed".
    pub async fn get_by_refresh_token(&self, token: &str) -> Result<Option<Session>> {
        let mut rows = self
            .conn
            .query(
                "SELECT refresh_token, fingerprint, user_id, created_at, expires_at \
                 FROM sessions WHERE refresh_token = ?1",
                libsql::params![token],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    /// Rotate: insert the new session, shorten the old one to the grace
    /// window, and mint an in-memory access token bound to `application_id`.
    pub async fn mint_access_token(
        &self,
        session: &Session,
        access_window: Duration,
        old_session_window: Duration,
        new_session_window: Duration,
        application_id: &str,
    ) -> Result<(AccessToken, Session)> {
        let now = Utc::now();
        let new_session = Session {
            refresh_token: generate_refresh_token(),
            fingerprint: String::new(),
            user_id: session.user_id,
            created_at: now,
            expires_at: expiry_after(now, new_session_window)?,
        };
        let new_session = Session {
            fingerprint: self.fingerprint_of(&new_session.refresh_token),
            ..new_session
        };
        let shortened = session
            .expires_at
            .min(expiry_after(now, old_session_window)?);

        // One transaction: the new row and the old row's shortening are
        // linearizable with respect to concurrent rotations.
        let conn = self.db.connect()?;
        let tx = conn.transaction().await?;
        tx.execute(
            "INSERT INTO sessions (refresh_token, fingerprint, user_id, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            libsql::params![
                new_session.refresh_token.clone(),
                new_session.fingerprint.clone(),
                new_session.user_id,
                new_session.created_at.to_rfc3339(),
                new_session.expires_at.to_rfc3339(),
            ],
        )
        .await?;
        tx.execute(
            "UPDATE sessions SET expires_at = ?1 WHERE refresh_token = ?2",
            libsql::params![shortened.to_rfc3339(), session.refresh_token.clone()],
        )
        .await?;
        tx.commit().await?;

        let access = AccessToken {
            token: uuid::Uuid::new_v4().to_string(),
            user_id: session.user_id,
            application_id: application_id.to_string(),
            refresh_token_fingerprint: new_session.fingerprint.clone(),
            // Never outlives the session it came from.
            expires_at: expiry_after(now, access_window)?.min(new_session.expires_at),
        };
        self.tokens.insert(access.token.clone(), access.clone());

        Ok((access, new_session))
    }

    /// Remove every session row for a user and evict their access tokens.
    pub async fn delete_sessions_for_user(&self, user_id: i64) -> Result<u64> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM sessions WHERE user_id = ?1",
                libsql::params![user_id],
            )
            .await?;
        self.tokens.retain(|_, token| token.user_id != user_id);
        Ok(deleted)
    }

    /// Garbage-collect expired rows and tokens.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let deleted = self
            .conn
            .execute(
                "DELETE FROM sessions WHERE expires_at < ?1",
                libsql::params![now.to_rfc3339()],
            )
            .await?;
        self.tokens.retain(|_, token| token.expires_at >= now);
        Ok(deleted)
    }

    /// Resolve an access token, evicting it lazily when expired.
    pub fn lookup_access_token(&self, token: &str) -> Option<AccessToken> {
        let now = Utc::now();
        let found = self.tokens.get(token).map(|entry| entry.clone());
        match found {
            Some(entry) if entry.expires_at >= now => Some(entry),
            Some(_) => {
                self.tokens.remove(token);
                None
            }
            None => None,
        }
    }

    /// Number of live access tokens (after a sweep), for diagnostics.
    pub fn access_token_count(&self) -> usize {
        self.tokens.len()
    }

    async fn insert_session(&self, conn: &libsql::Connection, session: &Session) -> Result<()> {
        conn.execute(
            "INSERT INTO sessions (refresh_token, fingerprint, user_id, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            libsql::params![
                session.refresh_token.clone(),
                session.fingerprint.clone(),
                session.user_id,
                session.created_at.to_rfc3339(),
                session.expires_at.to_rfc3339(),
            ],
        )
        .await?;
        Ok(())
    }
}

/// 32 bytes of CSPRNG output, URL-safe base64 without padding.
fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn expiry_after(now: DateTime<Utc>, window: Duration) -> Result<DateTime<Utc>> {
    let window = chrono::Duration::from_std(window)
        .map_err(|e| Error::Internal(format!("window out of range: {}", e)))?;
    Ok(now + window)
}

fn row_to_session(row: &libsql::Row) -> Result<Session> {
    let created_at: String = row.get(3)?;
    let expires_at: String = row.get(4)?;
    Ok(Session {
        refresh_token: row.get(0)?,
        fingerprint: row.get(1)?,
        user_id: row.get(2)?,
        created_at: parse_timestamp(&created_at)?,
        expires_at: parse_timestamp(&expires_at)?,
    })
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("corrupt timestamp '{}': {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> SessionManager {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        let fingerprint: FingerprintFn =
            Arc::new(|token| blake3::hash(token.as_bytes()).to_hex().to_string());
        SessionManager::open(db, fingerprint).await.unwrap()
    }

    const HOUR: Duration = Duration::from_secs(3600);
    const GRACE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn create_and_resolve_a_session() {
        let manager = manager().await;
        let session = manager.create_session(7, HOUR).await.unwrap();
        assert_eq!(session.refresh_token.len(), 43); // 32 bytes, unpadded
        assert_eq!(
            session.fingerprint,
            manager.fingerprint_of(&session.refresh_token)
        );

        let found = manager
            .get_by_refresh_token(&session.refresh_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.user_id, 7);
        assert!(!found.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn unknown_tokens_resolve_to_none() {
        let manager = manager().await;
        assert!(manager
            .get_by_refresh_token("nope")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn rotation_keeps_the_old_token_briefly() {
        let manager = manager().await;
        let session = manager.create_session(7, HOUR).await.unwrap();

        let (access, rotated) = manager
            .mint_access_token(&session, Duration::from_secs(600), GRACE, HOUR, "notes")
            .await
            .unwrap();
        assert_ne!(rotated.refresh_token, session.refresh_token);
        assert_eq!(access.user_id, 7);
        assert_eq!(access.application_id, "notes");
        assert_eq!(access.refresh_token_fingerprint, rotated.fingerprint);

        // The new token resolves.
        assert!(manager
            .get_by_refresh_token(&rotated.refresh_token)
            .await
            .unwrap()
            .is_some());

        // The old one still exists but expires within the grace window.
        let old = manager
            .get_by_refresh_token(&session.refresh_token)
            .await
            .unwrap()
            .unwrap();
        assert!(!old.is_expired(Utc::now()));
        assert!(old.expires_at <= Utc::now() + chrono::Duration::seconds(31));
    }

    #[tokio::test]
    async fn rotation_with_zero_grace_expires_the_old_token() {
        let manager = manager().await;
        let session = manager.create_session(7, HOUR).await.unwrap();
        manager
            .mint_access_token(
                &session,
                Duration::from_secs(600),
                Duration::ZERO,
                HOUR,
                "notes",
            )
            .await
            .unwrap();

        let old = manager
            .get_by_refresh_token(&session.refresh_token)
            .await
            .unwrap()
            .unwrap();
        assert!(old.is_expired(Utc::now() + chrono::Duration::seconds(1)));
    }

    #[tokio::test]
    async fn rotating_the_rotated_token_works() {
        let manager = manager().await;
        let session = manager.create_session(7, HOUR).await.unwrap();
        let (_, second) = manager
            .mint_access_token(&session, Duration::from_secs(600), GRACE, HOUR, "notes")
            .await
            .unwrap();
        let (_, third) = manager
            .mint_access_token(&second, Duration::from_secs(600), GRACE, HOUR, "notes")
            .await
            .unwrap();
        assert!(manager
            .get_by_refresh_token(&third.refresh_token)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn rotation_never_extends_an_old_short_session(){
        let manager = manager().await;
        let session = manager.create_session(7, Duration::from_secs(5)).await.unwrap();
        manager
            .mint_access_token(&session, Duration::from_secs(600), HOUR, HOUR, "notes")
            .await
            .unwrap();
        let old = manager
            .get_by_refresh_token(&session.refresh_token)
            .await
            .unwrap()
            .unwrap();
        // min(existing expiry, now + grace) picked the existing expiry.
        assert!(old.expires_at <= session.expires_at + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn access_tokens_expire_and_evict_lazily() {
        let manager = manager().await;
        let session = manager.create_session(7, HOUR).await.unwrap();
        let (access, _) = manager
            .mint_access_token(&session, Duration::ZERO, GRACE, HOUR, "notes")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.lookup_access_token(&access.token).is_none());
        assert_eq!(manager.access_token_count(), 0);
    }

    #[tokio::test]
    async fn access_token_lifetime_is_clamped_to_the_session() {
        let manager = manager().await;
        let session = manager.create_session(7, HOUR).await.unwrap();
        let (access, rotated) = manager
            .mint_access_token(
                &session,
                Duration::from_secs(86400),
                GRACE,
                Duration::from_secs(60),
                "notes",
            )
            .await
            .unwrap();
        assert!(access.expires_at <= rotated.expires_at);
    }

    #[tokio::test]
    async fn deleting_a_user_revokes_everything() {
        let manager = manager().await;
        let mine = manager.create_session(7, HOUR).await.unwrap();
        let theirs = manager.create_session(8, HOUR).await.unwrap();
        let (access, _) = manager
            .mint_access_token(&mine, Duration::from_secs(600), GRACE, HOUR, "notes")
            .await
            .unwrap();

        let deleted = manager.delete_sessions_for_user(7).await.unwrap();
        assert_eq!(deleted, 2); // original + rotated
        assert!(manager.lookup_access_token(&access.token).is_none());
        assert!(manager
            .get_by_refresh_token(&theirs.refresh_token)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn sweep_deletes_expired_rows() {
        let manager = manager().await;
        manager.create_session(7, Duration::ZERO).await.unwrap();
        let live = manager.create_session(8, HOUR).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let swept = manager.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert!(manager
            .get_by_refresh_token(&live.refresh_token)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn refresh_tokens_do_not_repeat() {
        let manager = manager().await;
        let a = manager.create_session(1, HOUR).await.unwrap();
        let b = manager.create_session(1, HOUR).await.unwrap();
        assert_ne!(a.refresh_token, b.refresh_token);
    }
}
