use crate::error::{ConclaveError, ConclaveResult};
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MAX_TENANT_LEN: usize = 128;

/// Check that a tenant (project) id is usable as a file stem.
pub fn validate_tenant(tenant: &str) -> ConclaveResult<()> {
    if tenant.is_empty() {
        return Err(ConclaveError::validation("tenant id must not be empty"));
    }
    if tenant.len() > MAX_TENANT_LEN {
        return Err(ConclaveError::validation(format!(
            "tenant id longer than {MAX_TENANT_LEN} characters"
        )));
    }
    if tenant.starts_with('.') {
        return Err(ConclaveError::validation(format!(
            "tenant id '{tenant}' must not start with '.'"
        )));
    }
    let ok = tenant
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok {
        return Err(ConclaveError::validation(format!(
            "tenant id '{tenant}' may only contain [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}

/// One SQLite database file per tenant, created on first use.
///
/// Every write runs inside an `IMMEDIATE` transaction, so the tenant's database
/// write lock is held from the first read to the commit: load, mutate and
/// save happen as one serialized step. Tenants never share a lock.
pub struct TenantDatabases {
    root: PathBuf,
    schema: &'static str,
    busy_timeout: Duration,
    conns: Mutex<HashMap<String, Arc<Mutex<Connection>>>>,
}

impl TenantDatabases {
    /// Open (creating if needed) the directory that holds the tenant files.
    /// `schema` is executed once per connection and must be idempotent.
    pub fn open(
        root: impl Into<PathBuf>,
        schema: &'static str,
        busy_timeout_ms: u64,
    ) -> ConclaveResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            schema,
            busy_timeout: Duration::from_millis(busy_timeout_ms),
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// Directory containing the tenant databases.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a tenant's database file.
    pub fn path_for(&self, tenant: &str) -> ConclaveResult<PathBuf> {
        validate_tenant(tenant)?;
        Ok(self.root.join(format!("{tenant}.db")))
    }

    fn connection(&self, tenant: &str) -> ConclaveResult<Arc<Mutex<Connection>>> {
        let path = self.path_for(tenant)?;
        if let Some(conn) = self.conns.lock().get(tenant) {
            return Ok(Arc::clone(conn));
        }
        // The map lock is not held while opening; a racing opener of the
        // same tenant drops its handle.
        let conn = Connection::open(&path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(self.schema)?;
        let mut conns = self.conns.lock();
        let conn = conns
            .entry(tenant.to_string())
            .or_insert_with(|| {
                debug!(tenant = %tenant, path = %path.display(), "opened tenant database");
                Arc::new(Mutex::new(conn))
            });
        Ok(Arc::clone(conn))
    }

    /// Run `f` under the tenant's exclusive write lock. The transaction commits
    /// only if `f` returns `Ok`; an `Err` rolls everything back.
    pub fn write<T>(
        &self,
        tenant: &str,
        f: impl FnOnce(&Connection) -> ConclaveResult<T>,
    ) -> ConclaveResult<T> {
        let conn = self.connection(tenant)?;
        let mut conn = conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` against a consistent read snapshot of the tenant's database.
    pub fn read<T>(
        &self,
        tenant: &str,
        f: impl FnOnce(&Connection) -> ConclaveResult<T>,
    ) -> ConclaveResult<T> {
        let conn = self.connection(tenant)?;
        let mut conn = conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v INTEGER NOT NULL);";

    #[test]
    fn test_validate_tenant() {
        assert!(validate_tenant("acme-prod_1.eu").is_ok());
        assert!(validate_tenant("").is_err());
        assert!(validate_tenant("../etc").is_err());
        assert!(validate_tenant("a/b").is_err());
        assert!(validate_tenant(".hidden").is_err());
    }

    #[test]
    fn test_write_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let dbs = TenantDatabases::open(dir.path(), SCHEMA, 1000).unwrap();

        dbs.write("t1", |conn| {
            conn.execute("INSERT INTO kv (k, v) VALUES ('a', 1)", [])?;
            Ok(())
        })
        .unwrap();

        let failed: ConclaveResult<()> = dbs.write("t1", |conn| {
            conn.execute("UPDATE kv SET v = 2 WHERE k = 'a'", [])?;
            Err(ConclaveError::Validation("abort".into()))
        });
        assert!(failed.is_err());

        let v: i64 = dbs
            .read("t1", |conn| {
                Ok(conn.query_row("SELECT v FROM kv WHERE k = 'a'", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn test_tenants_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let dbs = TenantDatabases::open(dir.path(), SCHEMA, 1000).unwrap();
        for tenant in ["alpha", "beta"] {
            dbs.write(tenant, |conn| {
                conn.execute("INSERT INTO kv (k, v) VALUES ('x', 1)", [])?;
                Ok(())
            })
            .unwrap();
        }
        assert!(dir.path().join("alpha.db").exists());
        assert!(dir.path().join("beta.db").exists());
    }
}
