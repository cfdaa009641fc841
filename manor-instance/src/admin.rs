//! Admin identity service
//!
//! The core `admin` instance is a native application: its users,
//! applications, and access rules live in ordinary tables in the instance
//! database, and its mutations arrive as events handled by the native
//! handlers below. It is authoritative for the `dologin` and `checkAccess`
//! internal RPCs.

use std::sync::Arc;

use async_trait::async_trait;
use manor_wire::InstanceDescriptor;
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::dbproxy::DbProxy;
use crate::error::{Error, Result};
use crate::events::{EventHandler, HandlerRegistry};

/// The administrator; cannot be deleted or renamed.
pub const ADMIN_USER_ID: i64 = 1;

/// Subject id of the built-in group containing every user.
pub const ALL_USERS_GROUP: i64 = 0;

/// Instance ids of the core applications; cannot be deleted.
pub const CORE_INSTANCE_IDS: [&str; 2] = ["admin", "login"];

/// ACCEPT/DENY side of an access rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleType {
    Accept,
    Deny,
}

impl RuleType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Deny => "DENY",
        }
    }

    fn parse(text: &str) -> Result<Self> {
        match text {
            "ACCEPT" => Ok(Self::Accept),
            "DENY" => Ok(Self::Deny),
            other => Err(Error::InvalidRequest(format!(
                "invalid rule type '{}'",
                other
            ))),
        }
    }
}

/// USER/GROUP side of an access rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubjectType {
    User,
    Group,
}

impl SubjectType {
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Group => "GROUP",
        }
    }

    fn parse(text: &str) -> Result<Self> {
        match text {
            "USER" => Ok(Self::User),
            "GROUP" => Ok(Self::Group),
            other => Err(Error::InvalidRequest(format!(
                "invalid subject type '{}'",
                other
            ))),
        }
    }
}

/// One access rule row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRule {
    pub id: i64,
    pub application_id: String,
    pub rule_type: RuleType,
    pub subject_type: SubjectType,
    pub subject_id: i64,
}

/// Evaluate the rules of one application for one user.
///
/// USER rules outrank GROUP rules; within a tier ACCEPT outranks DENY; no
/// matching rule means deny.
pub fn evaluate_access(rules: &[AccessRule], user_id: i64) -> bool {
    let mut user_denied = false;
    for rule in rules
        .iter()
        .filter(|r| r.subject_type == SubjectType::User && r.subject_id == user_id)
    {
        if rule.rule_type == RuleType::Accept {
            return true;
        }
        user_denied = true;
    }
    if user_denied {
        return false;
    }

    for rule in rules
        .iter()
        .filter(|r| r.subject_type == SubjectType::Group && r.subject_id == ALL_USERS_GROUP)
    {
        if rule.rule_type == RuleType::Accept {
            return true;
        }
    }
    false
}

/// `H(salt || password)` as lowercase hex.
pub fn hash_password(salt: &str, password: &str) -> String {
    password_digest(salt, password).to_hex().to_string()
}

fn password_digest(salt: &str, password: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hasher.finalize()
}

fn new_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Create the identity tables if absent.
pub async fn migrate(conn: &libsql::Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS users_v1 (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            salt TEXT NOT NULL,
            password_hash TEXT NOT NULL
        )
        "#,
        (),
    )
    .await?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS applications_v1 (
            instance_id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            host_name TEXT NOT NULL,
            db_name TEXT NOT NULL
        )
        "#,
        (),
    )
    .await?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS user_access_rules_v1 (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            application_id TEXT NOT NULL,
            rule_type TEXT NOT NULL CHECK (rule_type IN ('ACCEPT', 'DENY')),
            subject_type TEXT NOT NULL CHECK (subject_type IN ('USER', 'GROUP')),
            subject_id INTEGER NOT NULL
        )
        "#,
        (),
    )
    .await?;

    Ok(())
}

/// First-boot seeding: the administrator, the core applications, their
/// access rules, and the bootstrap event row. Idempotent.
pub async fn seed(conn: &libsql::Connection, public_domain: &str) -> Result<()> {
    crate::events::migrate(conn).await?;
    migrate(conn).await?;

    let salt = new_salt();
    let hash = hash_password(&salt, "admin");
    conn.execute(
        "INSERT OR IGNORE INTO users_v1 (id, username, salt, password_hash) \
         VALUES (?1, 'admin', ?2, ?3)",
        libsql::params![ADMIN_USER_ID, salt, hash],
    )
    .await?;

    let core_apps = [
        ("admin", "manor-admin", "Administration"),
        ("login", "manor-login", "Login"),
    ];
    for (instance_id, app_id, display_name) in core_apps {
        conn.execute(
            "INSERT OR IGNORE INTO applications_v1 \
             (instance_id, app_id, display_name, host_name, db_name) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            libsql::params![
                instance_id,
                app_id,
                display_name,
                format!("{}.{}", instance_id, public_domain),
                format!("{}.db", instance_id),
            ],
        )
        .await?;

        let mut rows = conn
            .query(
                "SELECT count(*) FROM user_access_rules_v1 \
                 WHERE application_id = ?1 AND subject_type = 'USER' AND subject_id = ?2",
                libsql::params![instance_id, ADMIN_USER_ID],
            )
            .await?;
        let existing = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        if existing == 0 {
            conn.execute(
                "INSERT INTO user_access_rules_v1 \
                 (application_id, rule_type, subject_type, subject_id) \
                 VALUES (?1, 'ACCEPT', 'USER', ?2)",
                libsql::params![instance_id, ADMIN_USER_ID],
            )
            .await?;
        }
    }

    // The login instance is reachable by every user.
    let mut rows = conn
        .query(
            "SELECT count(*) FROM user_access_rules_v1 \
             WHERE application_id = 'login' AND subject_type = 'GROUP'",
            (),
        )
        .await?;
    let existing = match rows.next().await? {
        Some(row) => row.get::<i64>(0)?,
        None => 0,
    };
    if existing == 0 {
        conn.execute(
            "INSERT INTO user_access_rules_v1 \
             (application_id, rule_type, subject_type, subject_id) \
             VALUES ('login', 'ACCEPT', 'GROUP', ?1)",
            libsql::params![ALL_USERS_GROUP],
        )
        .await?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO event_v1 (client_id, event_type, event_data, created_at) \
         VALUES ('bootstrap', 'BOOTSTRAP', '{\"type\":\"BOOTSTRAP\"}', ?1)",
        libsql::params![chrono::Utc::now().to_rfc3339()],
    )
    .await?;
    conn.execute(
        "UPDATE event_state SET current_event_id = \
         (SELECT COALESCE(MAX(id), 0) FROM event_v1) \
         WHERE id = 0 AND current_event_id < (SELECT COALESCE(MAX(id), 0) FROM event_v1)",
        (),
    )
    .await?;

    Ok(())
}

/// Verify credentials. `None` means unknown user or wrong password; the two
/// are indistinguishable to the caller and take the same time.
pub async fn dologin(
    conn: &libsql::Connection,
    username: &str,
    password: &str,
) -> Result<Option<i64>> {
    let mut rows = conn
        .query(
            "SELECT id, salt, password_hash FROM users_v1 WHERE username = ?1",
            libsql::params![username],
        )
        .await?;

    match rows.next().await? {
        Some(row) => {
            let id = row.get::<i64>(0)?;
            let salt = row.get::<String>(1)?;
            let stored = row.get::<String>(2)?;
            let presented = password_digest(&salt, password);
            // blake3::Hash equality is constant-time.
            let stored = blake3::Hash::from_hex(stored.as_bytes())
                .map_err(|e| Error::Internal(format!("corrupt password hash: {}", e)))?;
            Ok((presented == stored).then_some(id))
        }
        None => {
            // Burn the same hash work for unknown users.
            let _ = password_digest("missing", password);
            Ok(None)
        }
    }
}

/// Evaluate access for one user against one application's rules.
///
/// The administrator always passes; anything else would let the rule set
/// lock the operator out of their own fleet.
pub async fn check_access(
    conn: &libsql::Connection,
    user_id: i64,
    application_id: &str,
) -> Result<bool> {
    if user_id == ADMIN_USER_ID {
        return Ok(true);
    }
    let rules = rules_for_application(conn, application_id).await?;
    Ok(evaluate_access(&rules, user_id))
}

/// All rules of one application, in id order.
pub async fn rules_for_application(
    conn: &libsql::Connection,
    application_id: &str,
) -> Result<Vec<AccessRule>> {
    let mut rows = conn
        .query(
            "SELECT id, application_id, rule_type, subject_type, subject_id \
             FROM user_access_rules_v1 WHERE application_id = ?1 ORDER BY id",
            libsql::params![application_id],
        )
        .await?;

    let mut rules = Vec::new();
    while let Some(row) = rows.next().await? {
        rules.push(AccessRule {
            id: row.get::<i64>(0)?,
            application_id: row.get::<String>(1)?,
            rule_type: RuleType::parse(&row.get::<String>(2)?)?,
            subject_type: SubjectType::parse(&row.get::<String>(3)?)?,
            subject_id: row.get::<i64>(4)?,
        });
    }
    Ok(rules)
}

/// Every deployed application instance.
pub async fn list_instances(conn: &libsql::Connection) -> Result<Vec<InstanceDescriptor>> {
    let mut rows = conn
        .query(
            "SELECT instance_id, app_id, display_name, host_name, db_name \
             FROM applications_v1 ORDER BY instance_id",
            (),
        )
        .await?;

    let mut instances = Vec::new();
    while let Some(row) = rows.next().await? {
        instances.push(InstanceDescriptor {
            instance_id: row.get::<String>(0)?,
            app_id: row.get::<String>(1)?,
            display_name: row.get::<String>(2)?,
            host_name: row.get::<String>(3)?,
            db_name: row.get::<String>(4)?,
        });
    }
    Ok(instances)
}

// ---------------------------------------------------------------------------
// Native event handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum AdminOp {
    AddUser,
    UpdateUser,
    UpdateUserPassword,
    DeleteUser,
    AddApplication,
    UpdateApplication,
    DeleteApplication,
    CreateUserAccessRule,
    DeleteUserAccessRule,
}

struct AdminHandler {
    op: AdminOp,
}

/// Register the nine identity mutation handlers.
pub fn register_handlers(registry: &mut HandlerRegistry) {
    let ops = [
        ("ADD_USER", AdminOp::AddUser),
        ("UPDATE_USER", AdminOp::UpdateUser),
        ("UPDATE_USER_PASSWORD", AdminOp::UpdateUserPassword),
        ("DELETE_USER", AdminOp::DeleteUser),
        ("ADD_APPLICATION", AdminOp::AddApplication),
        ("UPDATE_APPLICATION", AdminOp::UpdateApplication),
        ("DELETE_APPLICATION", AdminOp::DeleteApplication),
        ("CREATE_USER_ACCESS_RULE", AdminOp::CreateUserAccessRule),
        ("DELETE_USER_ACCESS_RULE", AdminOp::DeleteUserAccessRule),
    ];
    for (event_type, op) in ops {
        registry.register(event_type, Arc::new(AdminHandler { op }));
    }
}

#[async_trait]
impl EventHandler for AdminHandler {
    async fn apply(&self, db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
        match self.op {
            AdminOp::AddUser => add_user(db, tx_id, payload).await,
            AdminOp::UpdateUser => update_user(db, tx_id, payload).await,
            AdminOp::UpdateUserPassword => update_user_password(db, tx_id, payload).await,
            AdminOp::DeleteUser => delete_user(db, tx_id, payload).await,
            AdminOp::AddApplication => add_application(db, tx_id, payload).await,
            AdminOp::UpdateApplication => update_application(db, tx_id, payload).await,
            AdminOp::DeleteApplication => delete_application(db, tx_id, payload).await,
            AdminOp::CreateUserAccessRule => create_access_rule(db, tx_id, payload).await,
            AdminOp::DeleteUserAccessRule => delete_access_rule(db, tx_id, payload).await,
        }
    }
}

fn parse_payload<T: DeserializeOwned>(payload: &JsonValue) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| Error::InvalidRequest(format!("malformed event payload: {}", e)))
}

fn default_password() -> String {
    String::new()
}

#[derive(Deserialize)]
struct AddUserPayload {
    username: String,
    #[serde(default = "default_password")]
    password: String,
}

async fn add_user(db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
    let body: AddUserPayload = parse_payload(payload)?;
    if body.username.is_empty() {
        return Err(Error::InvalidRequest("username is required".into()));
    }
    let existing = db
        .tx_query(
            tx_id,
            "SELECT id FROM users_v1 WHERE username = ?1",
            vec![libsql::Value::Text(body.username.clone())],
        )
        .await?;
    if !existing.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "username '{}' is taken",
            body.username
        )));
    }

    let salt = new_salt();
    let hash = hash_password(&salt, &body.password);
    db.tx_execute(
        tx_id,
        "INSERT INTO users_v1 (username, salt, password_hash) VALUES (?1, ?2, ?3)",
        vec![
            libsql::Value::Text(body.username),
            libsql::Value::Text(salt),
            libsql::Value::Text(hash),
        ],
    )
    .await?;
    Ok(true)
}

#[derive(Deserialize)]
struct UpdateUserPayload {
    id: i64,
    username: String,
}

async fn update_user(db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
    let body: UpdateUserPayload = parse_payload(payload)?;
    if body.id == ADMIN_USER_ID {
        return Err(Error::InvalidRequest(
            "the administrator cannot be renamed".into(),
        ));
    }
    let (_, affected) = db
        .tx_execute(
            tx_id,
            "UPDATE users_v1 SET username = ?1 WHERE id = ?2",
            vec![
                libsql::Value::Text(body.username),
                libsql::Value::Integer(body.id),
            ],
        )
        .await?;
    if affected == 0 {
        return Err(Error::NotFound(format!("no user with id {}", body.id)));
    }
    Ok(true)
}

#[derive(Deserialize)]
struct UpdateUserPasswordPayload {
    id: i64,
    password: String,
}

async fn update_user_password(db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
    let body: UpdateUserPasswordPayload = parse_payload(payload)?;
    let salt = new_salt();
    let hash = hash_password(&salt, &body.password);
    let (_, affected) = db
        .tx_execute(
            tx_id,
            "UPDATE users_v1 SET salt = ?1, password_hash = ?2 WHERE id = ?3",
            vec![
                libsql::Value::Text(salt),
                libsql::Value::Text(hash),
                libsql::Value::Integer(body.id),
            ],
        )
        .await?;
    if affected == 0 {
        return Err(Error::NotFound(format!("no user with id {}", body.id)));
    }
    Ok(true)
}

#[derive(Deserialize)]
struct DeleteUserPayload {
    id: i64,
}

async fn delete_user(db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
    let body: DeleteUserPayload = parse_payload(payload)?;
    if body.id == ADMIN_USER_ID {
        return Err(Error::InvalidRequest(
            "the administrator cannot be deleted".into(),
        ));
    }
    let (_, affected) = db
        .tx_execute(
            tx_id,
            "DELETE FROM users_v1 WHERE id = ?1",
            vec![libsql::Value::Integer(body.id)],
        )
        .await?;
    if affected == 0 {
        return Err(Error::NotFound(format!("no user with id {}", body.id)));
    }
    db.tx_execute(
        tx_id,
        "DELETE FROM user_access_rules_v1 WHERE subject_type = 'USER' AND subject_id = ?1",
        vec![libsql::Value::Integer(body.id)],
    )
    .await?;
    Ok(true)
}

#[derive(Deserialize)]
struct AddApplicationPayload {
    #[serde(default)]
    instance_id: Option<String>,
    app_id: String,
    display_name: String,
    host_name: String,
    #[serde(default)]
    db_name: Option<String>,
}

async fn host_name_taken(db: &DbProxy, tx_id: u64, host_name: &str, except: &str) -> Result<bool> {
    let rows = db
        .tx_query(
            tx_id,
            "SELECT instance_id FROM applications_v1 WHERE host_name = ?1 AND instance_id != ?2",
            vec![
                libsql::Value::Text(host_name.to_string()),
                libsql::Value::Text(except.to_string()),
            ],
        )
        .await?;
    Ok(!rows.is_empty())
}

async fn add_application(db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
    let body: AddApplicationPayload = parse_payload(payload)?;
    if body.host_name.is_empty() {
        return Err(Error::InvalidRequest("host_name is required".into()));
    }
    let instance_id = body
        .instance_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if host_name_taken(db, tx_id, &body.host_name, &instance_id).await? {
        return Err(Error::InvalidRequest(format!(
            "host name '{}' is already in use",
            body.host_name
        )));
    }
    let db_name = body
        .db_name
        .unwrap_or_else(|| format!("{}.db", instance_id));
    db.tx_execute(
        tx_id,
        "INSERT INTO applications_v1 (instance_id, app_id, display_name, host_name, db_name) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        vec![
            libsql::Value::Text(instance_id),
            libsql::Value::Text(body.app_id),
            libsql::Value::Text(body.display_name),
            libsql::Value::Text(body.host_name),
            libsql::Value::Text(db_name),
        ],
    )
    .await?;
    Ok(true)
}

#[derive(Deserialize)]
struct UpdateApplicationPayload {
    instance_id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    host_name: Option<String>,
}

async fn update_application(db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
    let body: UpdateApplicationPayload = parse_payload(payload)?;
    let mut changed = false;

    if let Some(host_name) = body.host_name {
        if host_name_taken(db, tx_id, &host_name, &body.instance_id).await? {
            return Err(Error::InvalidRequest(format!(
                "host name '{}' is already in use",
                host_name
            )));
        }
        let (_, affected) = db
            .tx_execute(
                tx_id,
                "UPDATE applications_v1 SET host_name = ?1 WHERE instance_id = ?2",
                vec![
                    libsql::Value::Text(host_name),
                    libsql::Value::Text(body.instance_id.clone()),
                ],
            )
            .await?;
        if affected == 0 {
            return Err(Error::NotFound(format!(
                "no application instance '{}'",
                body.instance_id
            )));
        }
        changed = true;
    }

    if let Some(display_name) = body.display_name {
        let (_, affected) = db
            .tx_execute(
                tx_id,
                "UPDATE applications_v1 SET display_name = ?1 WHERE instance_id = ?2",
                vec![
                    libsql::Value::Text(display_name),
                    libsql::Value::Text(body.instance_id.clone()),
                ],
            )
            .await?;
        if affected == 0 {
            return Err(Error::NotFound(format!(
                "no application instance '{}'",
                body.instance_id
            )));
        }
        changed = true;
    }

    Ok(changed)
}

#[derive(Deserialize)]
struct DeleteApplicationPayload {
    instance_id: String,
}

async fn delete_application(db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
    let body: DeleteApplicationPayload = parse_payload(payload)?;
    if CORE_INSTANCE_IDS.contains(&body.instance_id.as_str()) {
        return Err(Error::InvalidRequest(
            "core instances cannot be deleted".into(),
        ));
    }
    let (_, affected) = db
        .tx_execute(
            tx_id,
            "DELETE FROM applications_v1 WHERE instance_id = ?1",
            vec![libsql::Value::Text(body.instance_id.clone())],
        )
        .await?;
    if affected == 0 {
        return Err(Error::NotFound(format!(
            "no application instance '{}'",
            body.instance_id
        )));
    }
    db.tx_execute(
        tx_id,
        "DELETE FROM user_access_rules_v1 WHERE application_id = ?1",
        vec![libsql::Value::Text(body.instance_id)],
    )
    .await?;
    Ok(true)
}

#[derive(Deserialize)]
struct CreateAccessRulePayload {
    application_id: String,
    rule_type: RuleType,
    subject_type: SubjectType,
    subject_id: i64,
}

async fn create_access_rule(db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
    let body: CreateAccessRulePayload = parse_payload(payload)?;
    let apps = db
        .tx_query(
            tx_id,
            "SELECT instance_id FROM applications_v1 WHERE instance_id = ?1",
            vec![libsql::Value::Text(body.application_id.clone())],
        )
        .await?;
    if apps.is_empty() {
        return Err(Error::NotFound(format!(
            "no application instance '{}'",
            body.application_id
        )));
    }
    db.tx_execute(
        tx_id,
        "INSERT INTO user_access_rules_v1 (application_id, rule_type, subject_type, subject_id) \
         VALUES (?1, ?2, ?3, ?4)",
        vec![
            libsql::Value::Text(body.application_id),
            libsql::Value::Text(body.rule_type.as_str().to_string()),
            libsql::Value::Text(body.subject_type.as_str().to_string()),
            libsql::Value::Integer(body.subject_id),
        ],
    )
    .await?;
    Ok(true)
}

#[derive(Deserialize)]
struct DeleteAccessRulePayload {
    id: i64,
}

async fn delete_access_rule(db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
    let body: DeleteAccessRulePayload = parse_payload(payload)?;
    let (_, affected) = db
        .tx_execute(
            tx_id,
            "DELETE FROM user_access_rules_v1 WHERE id = ?1",
            vec![libsql::Value::Integer(body.id)],
        )
        .await?;
    if affected == 0 {
        return Err(Error::NotFound(format!("no access rule with id {}", body.id)));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::events::EventStore;
    use manor_wire::PublishStatus;
    use std::time::Duration;

    async fn admin_store() -> (Arc<DbProxy>, EventStore) {
        let db = Arc::new(DbProxy::new(open_memory_database().await.unwrap()).unwrap());
        seed(db.connection(), "example.test").await.unwrap();
        let mut registry = HandlerRegistry::new();
        register_handlers(&mut registry);
        let store = EventStore::open(db.clone(), registry, Duration::from_secs(50))
            .await
            .unwrap();
        (db, store)
    }

    async fn count(conn: &libsql::Connection, sql: &str) -> i64 {
        let mut rows = conn.query(sql, ()).await.unwrap();
        rows.next().await.unwrap().unwrap().get::<i64>(0).unwrap()
    }

    fn rule(rule_type: RuleType, subject_type: SubjectType, subject_id: i64) -> AccessRule {
        AccessRule {
            id: 0,
            application_id: "app".into(),
            rule_type,
            subject_type,
            subject_id,
        }
    }

    #[test]
    fn user_rules_outrank_group_rules() {
        let rules = vec![
            rule(RuleType::Deny, SubjectType::Group, ALL_USERS_GROUP),
            rule(RuleType::Accept, SubjectType::User, 7),
        ];
        assert!(evaluate_access(&rules, 7));
        assert!(!evaluate_access(&rules, 8));

        let rules = vec![
            rule(RuleType::Accept, SubjectType::Group, ALL_USERS_GROUP),
            rule(RuleType::Deny, SubjectType::User, 7),
        ];
        assert!(!evaluate_access(&rules, 7));
        assert!(evaluate_access(&rules, 8));
    }

    #[test]
    fn accept_outranks_deny_within_a_tier() {
        let rules = vec![
            rule(RuleType::Deny, SubjectType::User, 7),
            rule(RuleType::Accept, SubjectType::User, 7),
        ];
        assert!(evaluate_access(&rules, 7));
    }

    #[test]
    fn default_is_deny() {
        assert!(!evaluate_access(&[], 7));
        let unrelated = vec![rule(RuleType::Accept, SubjectType::User, 9)];
        assert!(!evaluate_access(&unrelated, 7));
    }

    #[tokio::test]
    async fn seed_is_idempotent_and_admin_can_log_in() {
        let (db, _store) = admin_store().await;
        seed(db.connection(), "example.test").await.unwrap();

        assert_eq!(count(db.connection(), "SELECT count(*) FROM users_v1").await, 1);
        assert_eq!(
            count(db.connection(), "SELECT count(*) FROM applications_v1").await,
            2
        );

        let id = dologin(db.connection(), "admin", "admin").await.unwrap();
        assert_eq!(id, Some(ADMIN_USER_ID));
        assert_eq!(
            dologin(db.connection(), "admin", "wrong").await.unwrap(),
            None
        );
        assert_eq!(
            dologin(db.connection(), "ghost", "admin").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn first_published_event_gets_id_two() {
        let (_db, store) = admin_store().await;
        let (status, id) = store
            .publish(
                "C1",
                serde_json::json!({"type": "ADD_USER", "username": "alice"}),
            )
            .await
            .unwrap();
        assert_eq!(status, PublishStatus::Success);
        assert_eq!(id, 2);
    }

    #[tokio::test]
    async fn add_user_is_deduplicated_by_client_id() {
        let (db, store) = admin_store().await;
        let payload = serde_json::json!({"type": "ADD_USER", "username": "alice"});
        let (_, id) = store.publish("C1", payload.clone()).await.unwrap();
        let (status, dup) = store.publish("C1", payload).await.unwrap();
        assert_eq!(status, PublishStatus::Duplicate);
        assert_eq!(dup, id);
        assert_eq!(
            count(
                db.connection(),
                "SELECT count(*) FROM users_v1 WHERE username = 'alice'"
            )
            .await,
            1
        );
    }

    #[tokio::test]
    async fn the_administrator_is_immutable() {
        let (db, store) = admin_store().await;
        let err = store
            .publish("C1", serde_json::json!({"type": "DELETE_USER", "id": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        let err = store
            .publish(
                "C2",
                serde_json::json!({"type": "UPDATE_USER", "id": 1, "username": "root"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        assert_eq!(count(db.connection(), "SELECT count(*) FROM users_v1").await, 1);
    }

    #[tokio::test]
    async fn deleting_a_user_cascades_their_rules() {
        let (db, store) = admin_store().await;
        store
            .publish(
                "C1",
                serde_json::json!({"type": "ADD_USER", "username": "alice"}),
            )
            .await
            .unwrap();
        store
            .publish(
                "C2",
                serde_json::json!({
                    "type": "CREATE_USER_ACCESS_RULE",
                    "application_id": "login",
                    "rule_type": "ACCEPT",
                    "subject_type": "USER",
                    "subject_id": 2
                }),
            )
            .await
            .unwrap();

        store
            .publish("C3", serde_json::json!({"type": "DELETE_USER", "id": 2}))
            .await
            .unwrap();
        assert_eq!(
            count(
                db.connection(),
                "SELECT count(*) FROM user_access_rules_v1 \
                 WHERE subject_type = 'USER' AND subject_id = 2"
            )
            .await,
            0
        );
    }

    #[tokio::test]
    async fn host_names_are_unique_among_instances() {
        let (_db, store) = admin_store().await;
        store
            .publish(
                "C1",
                serde_json::json!({
                    "type": "ADD_APPLICATION",
                    "instance_id": "notes",
                    "app_id": "notes-app",
                    "display_name": "Notes",
                    "host_name": "notes.example.test"
                }),
            )
            .await
            .unwrap();

        let err = store
            .publish(
                "C2",
                serde_json::json!({
                    "type": "ADD_APPLICATION",
                    "app_id": "other",
                    "display_name": "Other",
                    "host_name": "notes.example.test"
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn core_instances_cannot_be_deleted_but_others_cascade() {
        let (db, store) = admin_store().await;
        let err = store
            .publish(
                "C1",
                serde_json::json!({"type": "DELETE_APPLICATION", "instance_id": "admin"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        store
            .publish(
                "C2",
                serde_json::json!({
                    "type": "ADD_APPLICATION",
                    "instance_id": "notes",
                    "app_id": "notes-app",
                    "display_name": "Notes",
                    "host_name": "notes.example.test"
                }),
            )
            .await
            .unwrap();
        store
            .publish(
                "C3",
                serde_json::json!({
                    "type": "CREATE_USER_ACCESS_RULE",
                    "application_id": "notes",
                    "rule_type": "ACCEPT",
                    "subject_type": "GROUP",
                    "subject_id": 0
                }),
            )
            .await
            .unwrap();
        store
            .publish(
                "C4",
                serde_json::json!({"type": "DELETE_APPLICATION", "instance_id": "notes"}),
            )
            .await
            .unwrap();
        assert_eq!(
            count(
                db.connection(),
                "SELECT count(*) FROM user_access_rules_v1 WHERE application_id = 'notes'"
            )
            .await,
            0
        );
    }

    #[tokio::test]
    async fn group_deny_blocks_non_admin_users() {
        let (db, store) = admin_store().await;
        store
            .publish(
                "C1",
                serde_json::json!({"type": "ADD_USER", "username": "alice"}),
            )
            .await
            .unwrap();
        store
            .publish(
                "C2",
                serde_json::json!({
                    "type": "ADD_APPLICATION",
                    "instance_id": "notes",
                    "app_id": "notes-app",
                    "display_name": "Notes",
                    "host_name": "notes.example.test"
                }),
            )
            .await
            .unwrap();
        store
            .publish(
                "C3",
                serde_json::json!({
                    "type": "CREATE_USER_ACCESS_RULE",
                    "application_id": "notes",
                    "rule_type": "DENY",
                    "subject_type": "GROUP",
                    "subject_id": 0
                }),
            )
            .await
            .unwrap();

        assert!(!check_access(db.connection(), 2, "notes").await.unwrap());
        // The administrator is never locked out.
        assert!(check_access(db.connection(), ADMIN_USER_ID, "notes")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn password_hash_depends_on_salt_and_password() {
        let h1 = hash_password("salt-a", "secret");
        let h2 = hash_password("salt-b", "secret");
        let h3 = hash_password("salt-a", "other");
        assert_ne!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1, hash_password("salt-a", "secret"));
    }

    #[tokio::test]
    async fn password_updates_take_effect() {
        let (db, store) = admin_store().await;
        store
            .publish(
                "C1",
                serde_json::json!({"type": "ADD_USER", "username": "alice", "password": "one"}),
            )
            .await
            .unwrap();
        assert_eq!(
            dologin(db.connection(), "alice", "one").await.unwrap(),
            Some(2)
        );

        store
            .publish(
                "C2",
                serde_json::json!({"type": "UPDATE_USER_PASSWORD", "id": 2, "password": "two"}),
            )
            .await
            .unwrap();
        assert_eq!(dologin(db.connection(), "alice", "one").await.unwrap(), None);
        assert_eq!(
            dologin(db.connection(), "alice", "two").await.unwrap(),
            Some(2)
        );
    }
}
