use crate::Store;
use netpol_policy_server_core::{Claim, Error, LockService, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[async_trait::async_trait]
impl LockService for Store {
    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<Claim> {
        let (key, owner) = (key.to_string(), owner.to_string());
        self.write(move |tx, _| claim(tx, &key, &owner, ttl, SystemTime::now()))
            .await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let (key, owner) = (key.to_string(), owner.to_string());
        self.write(move |tx, _| {
            tx.execute(
                "DELETE FROM locks WHERE lock_key = ?1 AND owner = ?2",
                params![key, owner],
            )
            .map_err(Error::database)?;
            Ok(())
        })
        .await
    }
}

/// Takes or renews the lease on `key` unless another owner holds an
/// unexpired one.
pub(crate) fn claim(
    conn: &Connection,
    key: &str,
    owner: &str,
    ttl: Duration,
    now: SystemTime,
) -> Result<Claim> {
    let current = conn
        .query_row(
            "SELECT owner, expires_at_ms FROM locks WHERE lock_key = ?1",
            [key],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
        .map_err(Error::database)?;

    if let Some((holder, expires_at_ms)) = current {
        let expiry = from_millis(expires_at_ms);
        if holder != owner && expiry > now {
            return Ok(Claim { holder, expiry });
        }
    }

    let expiry = now + ttl;
    conn.execute(
        "INSERT INTO locks (lock_key, owner, expires_at_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT (lock_key) DO UPDATE SET owner = excluded.owner,
                                              expires_at_ms = excluded.expires_at_ms",
        params![key, owner, to_millis(expiry)],
    )
    .map_err(Error::database)?;
    Ok(Claim {
        holder: owner.to_string(),
        expiry,
    })
}

fn to_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn from_millis(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}
