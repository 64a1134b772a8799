//! Catalog operations: domains, users, role mailboxes, assignments
//!
//! Thin CRUD over the shared registry plus the two non-trivial paths:
//! get-or-create (insert race resolved by a single re-lookup) and role
//! assignment (transactional deactivate-then-upsert).

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::clock::from_epoch;
use crate::errors::{StoreError, StoreResult, is_unique_violation};
use crate::models::{Domain, RoleAssignment, RoleMailbox, User};

/// Look up a domain by name
pub fn find_domain(conn: &Connection, name: &str) -> StoreResult<Option<Domain>> {
    conn.query_row(
        "SELECT id, name, enabled FROM domains WHERE name = ?1",
        params![name],
        |row| {
            Ok(Domain {
                id: row.get(0)?,
                name: row.get(1)?,
                enabled: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Return the id of `name`, inserting the domain if absent
///
/// The insert path distinguishes the unique-violation race from other
/// failures and retries the lookup once on conflict.
///
/// # Errors
///
/// Returns `Conflict` if the post-race lookup still finds nothing.
pub fn get_or_create_domain(conn: &Connection, name: &str) -> StoreResult<i64> {
    if let Some(domain) = find_domain(conn, name)? {
        return Ok(domain.id);
    }
    match conn.execute("INSERT INTO domains (name) VALUES (?1)", params![name]) {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => find_domain(conn, name)?
            .map(|d| d.id)
            .ok_or_else(|| StoreError::Conflict(format!("domain '{name}'"))),
        Err(e) => Err(e.into()),
    }
}

/// List all registered domains
pub fn list_domains(conn: &Connection) -> StoreResult<Vec<Domain>> {
    let mut stmt = conn.prepare("SELECT id, name, enabled FROM domains ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok(Domain {
            id: row.get(0)?,
            name: row.get(1)?,
            enabled: row.get(2)?,
        })
    })?;
    rows.collect::<Result<_, _>>().map_err(Into::into)
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        domain_id: row.get(2)?,
        enabled: row.get(3)?,
        password_initialized: row.get(4)?,
    })
}

const USER_COLUMNS: &str = "id, username, domain_id, enabled, password_initialized";

/// Look up a user by identity pair
pub fn find_user(conn: &Connection, username: &str, domain_id: i64) -> StoreResult<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1 AND domain_id = ?2"),
        params![username, domain_id],
        user_from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Create a user through the admin-provisioning path
///
/// The account cannot sign in until password initialization completes,
/// so `password_initialized` starts false.
///
/// # Errors
///
/// Returns `AlreadyExists` if the identity pair is taken.
pub fn create_user(conn: &Connection, username: &str, domain_id: i64) -> StoreResult<i64> {
    match conn.execute(
        "INSERT INTO users (username, domain_id, password_initialized) VALUES (?1, ?2, 0)",
        params![username, domain_id],
    ) {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => {
            Err(StoreError::AlreadyExists(format!("user '{username}'")))
        }
        Err(e) => Err(e.into()),
    }
}

/// Return the user, inserting through the automated-delivery path if absent
///
/// The insert branch sets `password_initialized = true`; an existing row
/// is returned untouched.
///
/// # Errors
///
/// Returns `Conflict` if the post-race lookup still finds nothing.
pub fn get_or_create_user(conn: &Connection, username: &str, domain_id: i64) -> StoreResult<User> {
    if let Some(user) = find_user(conn, username, domain_id)? {
        return Ok(user);
    }
    match conn.execute(
        "INSERT INTO users (username, domain_id, password_initialized) VALUES (?1, ?2, 1)",
        params![username, domain_id],
    ) {
        Ok(_) => Ok(User {
            id: conn.last_insert_rowid(),
            username: username.to_owned(),
            domain_id,
            enabled: true,
            password_initialized: true,
        }),
        Err(e) if is_unique_violation(&e) => find_user(conn, username, domain_id)?
            .ok_or_else(|| StoreError::Conflict(format!("user '{username}'"))),
        Err(e) => Err(e.into()),
    }
}

/// List users in a domain
pub fn list_users(conn: &Connection, domain_id: i64) -> StoreResult<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE domain_id = ?1 ORDER BY username"
    ))?;
    let rows = stmt.query_map(params![domain_id], user_from_row)?;
    rows.collect::<Result<_, _>>().map_err(Into::into)
}

/// Enable or disable a user account
pub fn set_user_enabled(conn: &Connection, user_id: i64, enabled: bool) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE users SET enabled = ?2 WHERE id = ?1",
        params![user_id, enabled],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found(format!("user {user_id}")));
    }
    Ok(())
}

/// Record that a user has completed password setup
pub fn mark_password_initialized(conn: &Connection, user_id: i64) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE users SET password_initialized = 1 WHERE id = ?1",
        params![user_id],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found(format!("user {user_id}")));
    }
    Ok(())
}

fn role_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoleMailbox> {
    Ok(RoleMailbox {
        id: row.get(0)?,
        email: row.get(1)?,
        domain_id: row.get(2)?,
        description: row.get(3)?,
        enabled: row.get(4)?,
    })
}

const ROLE_COLUMNS: &str = "id, email, domain_id, description, enabled";

/// Look up a role mailbox by full address
pub fn find_role_mailbox(conn: &Connection, email: &str) -> StoreResult<Option<RoleMailbox>> {
    conn.query_row(
        &format!("SELECT {ROLE_COLUMNS} FROM role_mailboxes WHERE email = ?1"),
        params![email],
        role_from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Return the role mailbox id, inserting if absent
pub fn get_or_create_role_mailbox(
    conn: &Connection,
    email: &str,
    domain_id: i64,
    description: &str,
) -> StoreResult<i64> {
    if let Some(role) = find_role_mailbox(conn, email)? {
        return Ok(role.id);
    }
    match conn.execute(
        "INSERT INTO role_mailboxes (email, domain_id, description) VALUES (?1, ?2, ?3)",
        params![email, domain_id, description],
    ) {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => find_role_mailbox(conn, email)?
            .map(|r| r.id)
            .ok_or_else(|| StoreError::Conflict(format!("role mailbox '{email}'"))),
        Err(e) => Err(e.into()),
    }
}

/// List all role mailboxes
pub fn list_role_mailboxes(conn: &Connection) -> StoreResult<Vec<RoleMailbox>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ROLE_COLUMNS} FROM role_mailboxes ORDER BY email"
    ))?;
    let rows = stmt.query_map([], role_from_row)?;
    rows.collect::<Result<_, _>>().map_err(Into::into)
}

/// Assign a user as the active assignee of a role mailbox
///
/// Transactionally deactivates every currently active assignment for the
/// role, then upserts the `(user_id, role_mailbox_id)` pair as active.
/// Post-condition: exactly one active row for the role mailbox.
pub fn assign_role_mailbox(
    conn: &mut Connection,
    user_id: i64,
    role_mailbox_id: i64,
    assigned_by: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE user_role_assignments SET is_active = 0
         WHERE role_mailbox_id = ?1 AND is_active = 1",
        params![role_mailbox_id],
    )?;
    tx.execute(
        "INSERT INTO user_role_assignments
             (user_id, role_mailbox_id, assigned_by, assigned_at, is_active)
         VALUES (?1, ?2, ?3, ?4, 1)
         ON CONFLICT (user_id, role_mailbox_id) DO UPDATE SET
             assigned_by = excluded.assigned_by,
             assigned_at = excluded.assigned_at,
             is_active = 1",
        params![user_id, role_mailbox_id, assigned_by, now.timestamp()],
    )?;
    tx.commit()?;
    Ok(())
}

/// Current active assignment for a role mailbox, if any
pub fn active_assignment(
    conn: &Connection,
    role_mailbox_id: i64,
) -> StoreResult<Option<RoleAssignment>> {
    conn.query_row(
        "SELECT user_id, role_mailbox_id, assigned_by, assigned_at, is_active
         FROM user_role_assignments
         WHERE role_mailbox_id = ?1 AND is_active = 1",
        params![role_mailbox_id],
        |row| {
            Ok(RoleAssignment {
                user_id: row.get(0)?,
                role_mailbox_id: row.get(1)?,
                assigned_by: row.get(2)?,
                assigned_at: from_epoch(row.get(3)?),
                is_active: row.get(4)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rusqlite::Connection;

    use crate::schema;

    use super::{
        active_assignment, assign_role_mailbox, create_user, find_user, get_or_create_domain,
        get_or_create_role_mailbox, get_or_create_user,
    };

    fn catalog() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        schema::configure_connection(&conn).expect("configure");
        schema::install_catalog(&conn).expect("install");
        conn
    }

    #[test]
    fn get_or_create_domain_is_stable() {
        let conn = catalog();
        let a = get_or_create_domain(&conn, "example.com").expect("first");
        let b = get_or_create_domain(&conn, "example.com").expect("second");
        assert_eq!(a, b);
        let other = get_or_create_domain(&conn, "example.org").expect("other");
        assert_ne!(a, other);
    }

    #[test]
    fn delivery_provisioned_users_are_password_initialized() {
        let conn = catalog();
        let domain = get_or_create_domain(&conn, "example.com").expect("domain");
        let user = get_or_create_user(&conn, "alice", domain).expect("create");
        assert!(user.password_initialized);

        let again = get_or_create_user(&conn, "alice", domain).expect("existing");
        assert_eq!(again.id, user.id);
    }

    #[test]
    fn admin_provisioned_users_await_password_setup() {
        let conn = catalog();
        let domain = get_or_create_domain(&conn, "example.com").expect("domain");
        create_user(&conn, "bob", domain).expect("create");
        let user = find_user(&conn, "bob", domain)
            .expect("lookup")
            .expect("present");
        assert!(!user.password_initialized);

        // get-or-create must not flip the flag on the existing branch
        let again = get_or_create_user(&conn, "bob", domain).expect("existing");
        assert!(!again.password_initialized);
    }

    #[test]
    fn create_user_rejects_duplicate_identity() {
        let conn = catalog();
        let domain = get_or_create_domain(&conn, "example.com").expect("domain");
        create_user(&conn, "carol", domain).expect("first");
        let err = create_user(&conn, "carol", domain).expect_err("duplicate");
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn reassignment_leaves_exactly_one_active_row() {
        let mut conn = catalog();
        let domain = get_or_create_domain(&conn, "example.com").expect("domain");
        let u1 = get_or_create_user(&conn, "one", domain).expect("u1").id;
        let u2 = get_or_create_user(&conn, "two", domain).expect("u2").id;
        let role = get_or_create_role_mailbox(&conn, "support@example.com", domain, "support desk")
            .expect("role");

        assign_role_mailbox(&mut conn, u1, role, "admin", Utc::now()).expect("assign u1");
        assign_role_mailbox(&mut conn, u2, role, "admin", Utc::now()).expect("assign u2");

        let active: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM user_role_assignments
                 WHERE role_mailbox_id = ?1 AND is_active = 1",
                [role],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(active, 1);
        let assignment = active_assignment(&conn, role)
            .expect("query")
            .expect("present");
        assert_eq!(assignment.user_id, u2);
    }

    #[test]
    fn reassigning_the_original_user_reactivates_the_pair() {
        let mut conn = catalog();
        let domain = get_or_create_domain(&conn, "example.com").expect("domain");
        let u1 = get_or_create_user(&conn, "one", domain).expect("u1").id;
        let u2 = get_or_create_user(&conn, "two", domain).expect("u2").id;
        let role = get_or_create_role_mailbox(&conn, "sales@example.com", domain, "")
            .expect("role");

        assign_role_mailbox(&mut conn, u1, role, "admin", Utc::now()).expect("assign u1");
        assign_role_mailbox(&mut conn, u2, role, "admin", Utc::now()).expect("assign u2");
        assign_role_mailbox(&mut conn, u1, role, "admin", Utc::now()).expect("assign u1 again");

        let assignment = active_assignment(&conn, role)
            .expect("query")
            .expect("present");
        assert_eq!(assignment.user_id, u1);
    }
}
