use netpol_policy_server_core::{Error, Group, GroupKind, Result, Tag, TagWidth};
use rusqlite::{Connection, OptionalExtension};

pub(crate) fn all(conn: &Connection) -> Result<Vec<Group>> {
    let mut stmt = conn
        .prepare_cached("SELECT group_key, tag, kind FROM groups ORDER BY tag")
        .map_err(Error::database)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(Error::database)?;
    rows.map(|row| {
        let (key, tag, kind) = row.map_err(Error::database)?;
        mk_group(key, tag, &kind)
    })
    .collect()
}

pub(crate) fn lookup(conn: &Connection, key: &str) -> Result<Option<Group>> {
    conn.prepare_cached("SELECT tag, kind FROM groups WHERE group_key = ?1")
        .and_then(|mut stmt| {
            stmt.query_row([key], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
            })
            .optional()
        })
        .map_err(Error::database)?
        .map(|(tag, kind)| mk_group(key.to_string(), tag, &kind))
        .transpose()
}

/// Returns the group for `key`, creating it with `kind` if it does not exist.
///
/// An existing group keeps whatever kind it was created with.
pub(crate) fn ensure(conn: &Connection, width: TagWidth, key: &str, kind: GroupKind) -> Result<Group> {
    if let Some(group) = lookup(conn, key)? {
        return Ok(group);
    }

    let tag = next_free(conn, width)?;
    conn.execute(
        "INSERT INTO groups (tag, group_key, kind) VALUES (?1, ?2, ?3)",
        rusqlite::params![tag.get(), key, kind.as_str()],
    )
    .map_err(Error::database)?;
    tracing::debug!(%key, %tag, %kind, "Allocated tag");
    Ok(Group {
        key: key.to_string(),
        tag,
        kind,
    })
}

/// Like [`ensure`], but fails if the group exists with a different kind.
pub(crate) fn ensure_kind(
    conn: &Connection,
    width: TagWidth,
    key: &str,
    kind: GroupKind,
) -> Result<Group> {
    if key.is_empty() {
        return Err(Error::bad_request("missing id"));
    }
    let group = ensure(conn, width, key, kind)?;
    if group.kind != kind {
        return Err(Error::Conflict(format!(
            "group {key} already exists with type {}",
            group.kind
        )));
    }
    Ok(group)
}

/// Finds the smallest positive tag that no group holds.
///
/// Tags are allocated densely from 1, so a scan in tag order stops at the
/// first gap.
fn next_free(conn: &Connection, width: TagWidth) -> Result<Tag> {
    let mut stmt = conn
        .prepare_cached("SELECT tag FROM groups ORDER BY tag")
        .map_err(Error::database)?;
    let mut rows = stmt.query([]).map_err(Error::database)?;

    let mut candidate = 1u32;
    while let Some(row) = rows.next().map_err(Error::database)? {
        let tag = row.get::<_, u32>(0).map_err(Error::database)?;
        if tag != candidate {
            break;
        }
        candidate += 1;
    }

    if candidate > width.max_tag() {
        return Err(Error::TagSpaceExhausted {
            max: width.max_tag(),
        });
    }
    Tag::new(candidate).ok_or(Error::TagSpaceExhausted {
        max: width.max_tag(),
    })
}

/// Deletes each group in `keys` that no policy references.
pub(crate) fn release_unreferenced(conn: &Connection, keys: &[String]) -> Result<Vec<Group>> {
    let mut released = Vec::new();
    for key in keys {
        let Some(group) = lookup(conn, key)? else {
            continue;
        };
        let removed = conn
            .execute(
                "DELETE FROM groups WHERE tag = ?1 AND NOT EXISTS (
                    SELECT 1 FROM policies WHERE source_tag = ?1 OR destination_tag = ?1
                )",
                [group.tag.get()],
            )
            .map_err(Error::database)?;
        if removed > 0 {
            released.push(group);
        }
    }
    Ok(released)
}

fn mk_group(key: String, tag: u32, kind: &str) -> Result<Group> {
    let tag = Tag::new(tag).ok_or_else(|| {
        Error::Database(format!("group {key} has invalid tag {tag}").into())
    })?;
    Ok(Group {
        key,
        tag,
        kind: kind.parse()?,
    })
}
