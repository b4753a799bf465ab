//! Camera configuration and lifecycle event storage.
//!
//! The registry only needs a narrow contract: look up, list, insert, update
//! and delete camera rows (with `name` unique), and append / range-query
//! lifecycle events. `SqliteStore` is the production backend;
//! `InMemoryStore` backs tests.

use anyhow::anyhow;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{is_constraint_violation, CameraError};
use crate::{Camera, CameraEvent, EventAction, EventKind, TimestampMs};

pub trait CameraStore: Send {
    fn camera(&mut self, name: &str) -> Result<Option<Camera>, CameraError>;

    fn cameras(&mut self) -> Result<Vec<Camera>, CameraError>;

    /// Fails with `Conflict` if `name` is taken.
    fn insert_camera(&mut self, name: &str, source: &str, tag: &str)
        -> Result<Camera, CameraError>;

    /// Overwrites name/source/tag of the row with `camera.id`. Fails with
    /// `Conflict` if the new name is taken by another row.
    fn update_camera(&mut self, camera: &Camera) -> Result<(), CameraError>;

    /// Deletes the row and, with it, every event the camera owns.
    fn delete_camera(&mut self, id: i64) -> Result<(), CameraError>;
}

pub trait EventStore: Send {
    fn insert_event(
        &mut self,
        camera_id: i64,
        kind: EventKind,
        action: EventAction,
        timestamp_ms: TimestampMs,
    ) -> Result<CameraEvent, CameraError>;

    /// Most recent event for `(camera_id, kind)`.
    fn last_event(
        &mut self,
        camera_id: i64,
        kind: EventKind,
    ) -> Result<Option<CameraEvent>, CameraError>;

    /// Events with `from <= timestamp <= to`, oldest first. Ties keep
    /// insertion order.
    fn events_between(
        &mut self,
        camera_id: i64,
        kind: EventKind,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<Vec<CameraEvent>, CameraError>;
}

/// Everything the registry needs from one backing store.
pub trait Store: CameraStore + EventStore {}

impl<T: CameraStore + EventStore> Store for T {}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self, CameraError> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, CameraError> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<(), CameraError> {
        // journal_mode returns a row, so it cannot go through execute_batch.
        let _mode: String = self
            .conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS camera (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL UNIQUE,
              source TEXT NOT NULL,
              tag TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS camera_event (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id INTEGER NOT NULL REFERENCES camera(id) ON DELETE CASCADE,
              event_type TEXT NOT NULL,
              action TEXT NOT NULL,
              timestamp_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_camera_event_lookup
              ON camera_event(camera_id, event_type, timestamp_ms);
            "#,
        )?;
        Ok(())
    }
}

fn event_from_parts(
    id: i64,
    camera_id: i64,
    kind: &str,
    action: &str,
    timestamp_ms: TimestampMs,
) -> Result<CameraEvent, CameraError> {
    let kind = EventKind::parse(kind)
        .ok_or_else(|| anyhow!("corrupt event log: unknown event_type '{}'", kind))?;
    let action = EventAction::parse(action)
        .ok_or_else(|| anyhow!("corrupt event log: unknown action '{}'", action))?;
    Ok(CameraEvent {
        id,
        camera_id,
        kind,
        action,
        timestamp_ms,
    })
}

type EventRow = (i64, i64, String, String, i64);

fn event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn camera_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Camera> {
    Ok(Camera {
        id: row.get(0)?,
        name: row.get(1)?,
        source: row.get(2)?,
        tag: row.get(3)?,
    })
}

impl CameraStore for SqliteStore {
    fn camera(&mut self, name: &str) -> Result<Option<Camera>, CameraError> {
        let camera = self
            .conn
            .query_row(
                "SELECT id, name, source, tag FROM camera WHERE name = ?1",
                params![name],
                camera_row,
            )
            .optional()?;
        Ok(camera)
    }

    fn cameras(&mut self) -> Result<Vec<Camera>, CameraError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, source, tag FROM camera ORDER BY id ASC")?;
        let rows = stmt.query_map([], camera_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn insert_camera(
        &mut self,
        name: &str,
        source: &str,
        tag: &str,
    ) -> Result<Camera, CameraError> {
        match self.conn.execute(
            "INSERT INTO camera(name, source, tag) VALUES (?1, ?2, ?3)",
            params![name, source, tag],
        ) {
            Ok(_) => Ok(Camera {
                id: self.conn.last_insert_rowid(),
                name: name.to_string(),
                source: source.to_string(),
                tag: tag.to_string(),
            }),
            Err(err) if is_constraint_violation(&err) => {
                Err(CameraError::Conflict(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn update_camera(&mut self, camera: &Camera) -> Result<(), CameraError> {
        let changed = match self.conn.execute(
            "UPDATE camera SET name = ?1, source = ?2, tag = ?3 WHERE id = ?4",
            params![camera.name, camera.source, camera.tag, camera.id],
        ) {
            Ok(changed) => changed,
            Err(err) if is_constraint_violation(&err) => {
                return Err(CameraError::Conflict(camera.name.clone()))
            }
            Err(err) => return Err(err.into()),
        };
        if changed == 0 {
            return Err(CameraError::NotFound(camera.name.clone()));
        }
        Ok(())
    }

    fn delete_camera(&mut self, id: i64) -> Result<(), CameraError> {
        self.conn
            .execute("DELETE FROM camera WHERE id = ?1", params![id])?;
        Ok(())
    }
}

impl EventStore for SqliteStore {
    fn insert_event(
        &mut self,
        camera_id: i64,
        kind: EventKind,
        action: EventAction,
        timestamp_ms: TimestampMs,
    ) -> Result<CameraEvent, CameraError> {
        self.conn.execute(
            r#"
            INSERT INTO camera_event(camera_id, event_type, action, timestamp_ms)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![camera_id, kind.as_str(), action.as_str(), timestamp_ms],
        )?;
        Ok(CameraEvent {
            id: self.conn.last_insert_rowid(),
            camera_id,
            kind,
            action,
            timestamp_ms,
        })
    }

    fn last_event(
        &mut self,
        camera_id: i64,
        kind: EventKind,
    ) -> Result<Option<CameraEvent>, CameraError> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, camera_id, event_type, action, timestamp_ms FROM camera_event
                WHERE camera_id = ?1 AND event_type = ?2
                ORDER BY timestamp_ms DESC, id DESC LIMIT 1
                "#,
                params![camera_id, kind.as_str()],
                event_row,
            )
            .optional()?;
        match row {
            Some((id, camera_id, kind, action, ts)) => {
                Ok(Some(event_from_parts(id, camera_id, &kind, &action, ts)?))
            }
            None => Ok(None),
        }
    }

    fn events_between(
        &mut self,
        camera_id: i64,
        kind: EventKind,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<Vec<CameraEvent>, CameraError> {
        let rows = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT id, camera_id, event_type, action, timestamp_ms FROM camera_event
                WHERE camera_id = ?1 AND event_type = ?2
                  AND timestamp_ms >= ?3 AND timestamp_ms <= ?4
                ORDER BY timestamp_ms ASC, id ASC
                "#,
            )?;
            let mapped = stmt.query_map(params![camera_id, kind.as_str(), from, to], event_row)?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            rows
        };

        rows.into_iter()
            .map(|(id, camera_id, kind, action, ts)| {
                event_from_parts(id, camera_id, &kind, &action, ts)
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    cameras: Vec<Camera>,
    events: Vec<CameraEvent>,
    next_camera_id: i64,
    next_event_id: i64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored event, in insertion order.
    pub fn all_events(&self) -> &[CameraEvent] {
        &self.events
    }
}

impl CameraStore for InMemoryStore {
    fn camera(&mut self, name: &str) -> Result<Option<Camera>, CameraError> {
        Ok(self.cameras.iter().find(|c| c.name == name).cloned())
    }

    fn cameras(&mut self) -> Result<Vec<Camera>, CameraError> {
        Ok(self.cameras.clone())
    }

    fn insert_camera(
        &mut self,
        name: &str,
        source: &str,
        tag: &str,
    ) -> Result<Camera, CameraError> {
        if self.cameras.iter().any(|c| c.name == name) {
            return Err(CameraError::Conflict(name.to_string()));
        }
        self.next_camera_id += 1;
        let camera = Camera {
            id: self.next_camera_id,
            name: name.to_string(),
            source: source.to_string(),
            tag: tag.to_string(),
        };
        self.cameras.push(camera.clone());
        Ok(camera)
    }

    fn update_camera(&mut self, camera: &Camera) -> Result<(), CameraError> {
        if self
            .cameras
            .iter()
            .any(|c| c.name == camera.name && c.id != camera.id)
        {
            return Err(CameraError::Conflict(camera.name.clone()));
        }
        let row = self
            .cameras
            .iter_mut()
            .find(|c| c.id == camera.id)
            .ok_or_else(|| CameraError::NotFound(camera.name.clone()))?;
        *row = camera.clone();
        Ok(())
    }

    fn delete_camera(&mut self, id: i64) -> Result<(), CameraError> {
        self.cameras.retain(|c| c.id != id);
        self.events.retain(|e| e.camera_id != id);
        Ok(())
    }
}

impl EventStore for InMemoryStore {
    fn insert_event(
        &mut self,
        camera_id: i64,
        kind: EventKind,
        action: EventAction,
        timestamp_ms: TimestampMs,
    ) -> Result<CameraEvent, CameraError> {
        self.next_event_id += 1;
        let event = CameraEvent {
            id: self.next_event_id,
            camera_id,
            kind,
            action,
            timestamp_ms,
        };
        self.events.push(event.clone());
        Ok(event)
    }

    fn last_event(
        &mut self,
        camera_id: i64,
        kind: EventKind,
    ) -> Result<Option<CameraEvent>, CameraError> {
        Ok(self
            .events
            .iter()
            .filter(|e| e.camera_id == camera_id && e.kind == kind)
            .max_by_key(|e| (e.timestamp_ms, e.id))
            .cloned())
    }

    fn events_between(
        &mut self,
        camera_id: i64,
        kind: EventKind,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<Vec<CameraEvent>, CameraError> {
        let mut out: Vec<CameraEvent> = self
            .events
            .iter()
            .filter(|e| {
                e.camera_id == camera_id
                    && e.kind == kind
                    && e.timestamp_ms >= from
                    && e.timestamp_ms <= to
            })
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.timestamp_ms, e.id));
        Ok(out)
    }
}
