use crate::tags;
use netpol_policy_server_core::{
    Error, Filter, GroupKind, Policy, PortRange, Protocol, Result, Tag, TagWidth, TaggedPolicy,
};
use rusqlite::{params, Connection};
use std::collections::BTreeSet;

/// Selects policies and their endpoint tags in one statement so that every
/// returned row carries both tags.
const SELECT_TAGGED: &str = "
SELECT s.group_key, s.tag, d.group_key, d.tag, p.protocol, p.port_start, p.port_end
FROM policies p
JOIN groups s ON s.tag = p.source_tag
JOIN groups d ON d.tag = p.destination_tag
WHERE ?1 IS NULL
   OR s.group_key IN (SELECT value FROM json_each(?1))
   OR d.group_key IN (SELECT value FROM json_each(?1))
ORDER BY s.group_key, d.group_key, p.protocol, p.port_start, p.port_end
";

pub(crate) fn select(conn: &Connection, filter: &Filter) -> Result<Vec<TaggedPolicy>> {
    let keys = filter
        .as_keys()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Error::database)?;

    let mut stmt = conn.prepare_cached(SELECT_TAGGED).map_err(Error::database)?;
    let rows = stmt
        .query_map([keys], |row| {
            Ok(Row {
                source: row.get(0)?,
                source_tag: row.get(1)?,
                destination: row.get(2)?,
                destination_tag: row.get(3)?,
                protocol: row.get(4)?,
                port_start: row.get(5)?,
                port_end: row.get(6)?,
            })
        })
        .map_err(Error::database)?;

    rows.map(|row| row.map_err(Error::database)?.into_tagged())
        .collect()
}

/// Inserts `policies`, allocating tags for newly referenced groups in the same
/// transaction.
pub(crate) fn insert(
    conn: &Connection,
    width: TagWidth,
    policies: Vec<Policy>,
    max_per_source: Option<usize>,
) -> Result<()> {
    let mut sources = BTreeSet::new();
    for policy in &policies {
        let src = tags::ensure(conn, width, &policy.source, GroupKind::App)?;
        let dst = tags::ensure(conn, width, &policy.destination, GroupKind::App)?;
        conn.execute(
            "INSERT OR IGNORE INTO policies
                (source_tag, destination_tag, protocol, port_start, port_end)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                src.tag.get(),
                dst.tag.get(),
                policy.protocol.as_str(),
                policy.ports.start(),
                policy.ports.end(),
            ],
        )
        .map_err(Error::database)?;
        sources.insert((policy.source.as_str(), src.tag));
    }

    if let Some(max) = max_per_source {
        for (key, tag) in sources {
            let count = count_for_source(conn, tag)?;
            if count > max {
                return Err(Error::QuotaExceeded {
                    group: key.to_string(),
                    max,
                });
            }
        }
    }

    Ok(())
}

/// Deletes the given policies, returning those that existed.
pub(crate) fn delete(conn: &Connection, policies: Vec<Policy>) -> Result<Vec<Policy>> {
    let mut deleted = Vec::with_capacity(policies.len());
    for policy in policies {
        let (Some(src), Some(dst)) = (
            tags::lookup(conn, &policy.source)?,
            tags::lookup(conn, &policy.destination)?,
        ) else {
            continue;
        };
        let n = conn
            .execute(
                "DELETE FROM policies
                 WHERE source_tag = ?1 AND destination_tag = ?2 AND protocol = ?3
                   AND port_start = ?4 AND port_end = ?5",
                params![
                    src.tag.get(),
                    dst.tag.get(),
                    policy.protocol.as_str(),
                    policy.ports.start(),
                    policy.ports.end(),
                ],
            )
            .map_err(Error::database)?;
        if n > 0 {
            deleted.push(policy);
        }
    }
    Ok(deleted)
}

fn count_for_source(conn: &Connection, tag: Tag) -> Result<usize> {
    conn.query_row(
        "SELECT COUNT(*) FROM policies WHERE source_tag = ?1",
        [tag.get()],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n.max(0) as usize)
    .map_err(Error::database)
}

struct Row {
    source: String,
    source_tag: u32,
    destination: String,
    destination_tag: u32,
    protocol: String,
    port_start: u16,
    port_end: u16,
}

// === impl Row ===

impl Row {
    fn into_tagged(self) -> Result<TaggedPolicy> {
        let invalid = |what: &str| Error::Database(format!("stored policy has {what}").into());
        let protocol = self
            .protocol
            .parse::<Protocol>()
            .map_err(|_| invalid("an unknown protocol"))?;
        let ports = PortRange::new(self.port_start, self.port_end)
            .map_err(|_| invalid("an invalid port range"))?;
        let source_tag = Tag::new(self.source_tag).ok_or_else(|| invalid("a zero source tag"))?;
        let destination_tag =
            Tag::new(self.destination_tag).ok_or_else(|| invalid("a zero destination tag"))?;
        Ok(TaggedPolicy {
            policy: Policy {
                source: self.source,
                destination: self.destination,
                protocol,
                ports,
            },
            source_tag,
            destination_tag,
        })
    }
}
