use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{limit_to_i64, parse_status},
    models::{RenderRecord, RenderStatus},
};

const RENDER_COLUMNS: &str =
    "id, key, status, url, url_fingerprint, name_hint, html, archived, created_at, updated_at";

fn row_to_render(row: &Row) -> Result<RenderRecord> {
    let status: String = row.get("status")?;

    Ok(RenderRecord {
        id: row.get("id")?,
        key: row.get("key")?,
        status: parse_status(&status)?,
        url: row.get("url")?,
        url_fingerprint: row.get("url_fingerprint")?,
        name_hint: row.get("name_hint")?,
        html: row.get("html")?,
        archived: row.get::<_, i64>("archived")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn owner_of(conn: &rusqlite::Connection, render_id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT owner FROM renders WHERE id = ?1",
        params![render_id],
        |row| row.get(0),
    )
    .optional()
    .context("failed to look up render owner")
}

impl Database {
    pub async fn insert_render(&self, owner: &str, render: &RenderRecord) -> Result<()> {
        let owner = owner.to_string();
        let record = render.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO renders (id, owner, key, status, url, url_fingerprint, name_hint, html, archived, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    owner,
                    record.key,
                    record.status.as_str(),
                    record.url,
                    record.url_fingerprint,
                    record.name_hint,
                    record.html,
                    i64::from(record.archived),
                    record.created_at,
                    record.updated_at,
                ],
            )
            .with_context(|| format!("failed to insert render {}", record.id))?;
            Ok(())
        })
        .await
    }

    /// Record a job outcome. Returns the owner, or `None` if the render no longer exists.
    pub async fn update_render_result(
        &self,
        render_id: &str,
        status: RenderStatus,
        html: Option<String>,
        updated_at: i64,
    ) -> Result<Option<String>> {
        let render_id = render_id.to_string();
        self.execute(move |conn| {
            let owner = owner_of(conn, &render_id)?;
            if owner.is_some() {
                conn.execute(
                    "UPDATE renders
                     SET status = ?1,
                         html = ?2,
                         updated_at = ?3
                     WHERE id = ?4",
                    params![status.as_str(), html, updated_at, render_id],
                )
                .context("failed to update render result")?;
            }
            Ok(owner)
        })
        .await
    }

    pub async fn archive_render(&self, render_id: &str, updated_at: i64) -> Result<Option<String>> {
        let render_id = render_id.to_string();
        self.execute(move |conn| {
            let owner = owner_of(conn, &render_id)?;
            if owner.is_some() {
                conn.execute(
                    "UPDATE renders SET archived = 1, updated_at = ?1 WHERE id = ?2",
                    params![updated_at, render_id],
                )
                .context("failed to archive render")?;
            }
            Ok(owner)
        })
        .await
    }

    /// Hard delete. Returns the owner of the removed row, if there was one.
    pub async fn delete_render(&self, render_id: &str) -> Result<Option<String>> {
        let render_id = render_id.to_string();
        self.execute(move |conn| {
            let owner = owner_of(conn, &render_id)?;
            conn.execute("DELETE FROM renders WHERE id = ?1", params![render_id])
                .context("failed to delete render")?;
            Ok(owner)
        })
        .await
    }

    pub async fn get_render(&self, render_id: &str) -> Result<Option<RenderRecord>> {
        let render_id = render_id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {RENDER_COLUMNS} FROM renders WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![render_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_render(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Owner's non-archived renders, newest first, capped at `limit`.
    pub async fn list_renders(&self, owner: &str, limit: usize) -> Result<Vec<RenderRecord>> {
        let owner = owner.to_string();
        let limit = limit_to_i64(limit)?;
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {RENDER_COLUMNS} FROM renders
                 WHERE owner = ?1 AND archived = 0
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![owner, limit])?;

            let mut renders = Vec::new();
            while let Some(row) = rows.next()? {
                renders.push(row_to_render(row)?);
            }
            Ok(renders)
        })
        .await
    }
}
