//! SQLite schema and row-level operations for the recognition log.
//!
//! Everything here is synchronous and runs on the connection's own thread
//! (through `tokio_rusqlite::Connection::call`) or directly in tests.

use crate::entry::{LogQuery, RecognitionLogEntry, ResultKind};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::Serialize;
use uuid::Uuid;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS recognition_log (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT    NOT NULL UNIQUE,
    timestamp_ms  INTEGER NOT NULL,
    kind          TEXT    NOT NULL,
    identity_id   TEXT,
    identity_name TEXT,
    confidence    REAL,
    quality       REAL,
    duration_ms   INTEGER NOT NULL,
    image         BLOB,
    error_message TEXT,
    size_bytes    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recognition_log_time
    ON recognition_log (timestamp_ms, seq);
CREATE INDEX IF NOT EXISTS idx_recognition_log_identity
    ON recognition_log (identity_id, timestamp_ms);
";

const SELECT_COLUMNS: &str = "id, timestamp_ms, kind, identity_id, identity_name, confidence, \
     quality, duration_ms, image, error_message";

/// Current occupancy of the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub entries: u64,
    pub bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}

pub(crate) fn insert(conn: &Connection, entry: &RecognitionLogEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO recognition_log (
            id, timestamp_ms, kind, identity_id, identity_name, confidence,
            quality, duration_ms, image, error_message, size_bytes
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.id.to_string(),
            entry.timestamp.timestamp_millis(),
            entry.kind.as_str(),
            entry.identity_id,
            entry.identity_name,
            entry.confidence.map(f64::from),
            entry.quality.map(f64::from),
            to_i64(entry.duration_ms),
            entry.image,
            entry.error_message,
            to_i64(entry.stored_size()),
        ],
    )?;
    Ok(())
}

pub(crate) fn query(conn: &Connection, q: &LogQuery) -> rusqlite::Result<Vec<RecognitionLogEntry>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(kind) = q.kind {
        clauses.push("kind = ?");
        values.push(Value::Text(kind.as_str().to_string()));
    }
    if let Some(since) = q.since {
        clauses.push("timestamp_ms >= ?");
        values.push(Value::Integer(since.timestamp_millis()));
    }
    if let Some(until) = q.until {
        clauses.push("timestamp_ms < ?");
        values.push(Value::Integer(until.timestamp_millis()));
    }
    if let Some(identity) = &q.identity_id {
        clauses.push("identity_id = ?");
        values.push(Value::Text(identity.clone()));
    }

    let mut sql = format!("SELECT {SELECT_COLUMNS} FROM recognition_log");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY timestamp_ms DESC, seq DESC");
    if let Some(limit) = q.limit {
        sql.push_str(" LIMIT ?");
        values.push(Value::Integer(to_i64(limit as u64)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), decode_row)?;
    let entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

pub(crate) fn stats(conn: &Connection) -> rusqlite::Result<LogStats> {
    conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0), MIN(timestamp_ms), MAX(timestamp_ms)
         FROM recognition_log",
        [],
        |row| {
            let oldest: Option<i64> = row.get(2)?;
            let newest: Option<i64> = row.get(3)?;
            Ok(LogStats {
                entries: row.get::<_, i64>(0)?.max(0) as u64,
                bytes: row.get::<_, i64>(1)?.max(0) as u64,
                oldest: oldest.and_then(DateTime::from_timestamp_millis),
                newest: newest.and_then(DateTime::from_timestamp_millis),
            })
        },
    )
}

/// Delete the `count` oldest entries. Returns rows removed.
pub(crate) fn delete_oldest(conn: &Connection, count: u64) -> rusqlite::Result<usize> {
    if count == 0 {
        return Ok(0);
    }
    conn.execute(
        "DELETE FROM recognition_log WHERE seq IN (
            SELECT seq FROM recognition_log ORDER BY timestamp_ms ASC, seq ASC LIMIT ?1
         )",
        params![to_i64(count)],
    )
}

/// Delete oldest entries until at least `bytes_to_free` bytes are released.
/// Returns (rows removed, bytes released).
pub(crate) fn delete_oldest_bytes(
    conn: &Connection,
    bytes_to_free: u64,
) -> rusqlite::Result<(usize, u64)> {
    if bytes_to_free == 0 {
        return Ok((0, 0));
    }

    let mut victims = Vec::new();
    let mut freed = 0u64;
    {
        let mut stmt =
            conn.prepare(
                "SELECT seq, size_bytes FROM recognition_log ORDER BY timestamp_ms ASC, seq ASC",
            )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            if freed >= bytes_to_free {
                break;
            }
            let seq: i64 = row.get(0)?;
            let size: i64 = row.get(1)?;
            victims.push(seq);
            freed += size.max(0) as u64;
        }
    }

    let mut stmt = conn.prepare("DELETE FROM recognition_log WHERE seq = ?1")?;
    for seq in &victims {
        stmt.execute(params![seq])?;
    }
    Ok((victims.len(), freed))
}

/// Delete entries strictly older than `cutoff`.
pub(crate) fn delete_older_than(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM recognition_log WHERE timestamp_ms < ?1",
        params![cutoff.timestamp_millis()],
    )
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn decode_row(row: &Row<'_>) -> rusqlite::Result<RecognitionLogEntry> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;

    let ts: i64 = row.get(1)?;
    let timestamp = DateTime::from_timestamp_millis(ts)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, ts))?;

    let kind: String = row.get(2)?;
    let kind = kind
        .parse::<ResultKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    let confidence: Option<f64> = row.get(5)?;
    let quality: Option<f64> = row.get(6)?;
    let duration_ms: i64 = row.get(7)?;

    Ok(RecognitionLogEntry {
        id,
        timestamp,
        kind,
        identity_id: row.get(3)?,
        identity_name: row.get(4)?,
        confidence: confidence.map(|v| v as f32),
        quality: quality.map(|v| v as f32),
        duration_ms: duration_ms.max(0) as u64,
        image: row.get(8)?,
        error_message: row.get(9)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        conn
    }

    pub(crate) fn base_time() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_insert_and_read_back() {
        let conn = open();
        let entry = RecognitionLogEntry::new(ResultKind::Matched, 42)
            .at(base_time())
            .with_identity("e-7", "Grace")
            .with_confidence(0.75)
            .with_quality(0.9)
            .with_image(vec![0xFF, 0xD8, 0x00]);
        insert(&conn, &entry).unwrap();

        let rows = query(&conn, &LogQuery::default()).unwrap();
        assert_eq!(rows, vec![entry]);
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = open();
        init(&conn).unwrap();
        assert_eq!(stats(&conn).unwrap(), LogStats::default());
    }

    #[test]
    fn test_query_filters_and_orders_newest_first() {
        let conn = open();
        let t0 = base_time();
        for i in 0..6 {
            let kind = if i % 2 == 0 { ResultKind::Matched } else { ResultKind::Unmatched };
            let mut e = RecognitionLogEntry::new(kind, i).at(t0 + Duration::seconds(i as i64));
            if kind == ResultKind::Matched {
                e = e.with_identity(format!("e-{}", i % 4), "x");
            }
            insert(&conn, &e).unwrap();
        }

        let matched = query(&conn, &LogQuery::default().kind(ResultKind::Matched)).unwrap();
        assert_eq!(matched.iter().map(|e| e.duration_ms).collect::<Vec<_>>(), vec![4, 2, 0]);

        let ranged = query(
            &conn,
            &LogQuery::default()
                .since(t0 + Duration::seconds(1))
                .until(t0 + Duration::seconds(4)),
        )
        .unwrap();
        assert_eq!(ranged.iter().map(|e| e.duration_ms).collect::<Vec<_>>(), vec![3, 2, 1]);

        let by_identity = query(&conn, &LogQuery::default().identity("e-0")).unwrap();
        assert_eq!(by_identity.iter().map(|e| e.duration_ms).collect::<Vec<_>>(), vec![4, 0]);

        let limited = query(&conn, &LogQuery::default().limit(2)).unwrap();
        assert_eq!(limited.iter().map(|e| e.duration_ms).collect::<Vec<_>>(), vec![5, 4]);
    }

    #[test]
    fn test_stats_tracks_bytes_and_range() {
        let conn = open();
        let t0 = base_time();
        let a = RecognitionLogEntry::new(ResultKind::NoFace, 1).at(t0);
        let b = RecognitionLogEntry::new(ResultKind::NoFace, 1)
            .at(t0 + Duration::minutes(5))
            .with_image(vec![0u8; 500]);
        insert(&conn, &a).unwrap();
        insert(&conn, &b).unwrap();

        let s = stats(&conn).unwrap();
        assert_eq!(s.entries, 2);
        assert_eq!(s.bytes, a.stored_size() + b.stored_size());
        assert_eq!(s.oldest, Some(t0));
        assert_eq!(s.newest, Some(t0 + Duration::minutes(5)));
    }

    #[test]
    fn test_delete_oldest_uses_timestamp_not_insert_order() {
        let conn = open();
        let t0 = base_time();
        for offset in [5, 1, 4, 2, 3] {
            let at = t0 + Duration::seconds(offset as i64);
            insert(&conn, &RecognitionLogEntry::new(ResultKind::NoFace, offset).at(at)).unwrap();
        }
        assert_eq!(delete_oldest(&conn, 2).unwrap(), 2);
        let left: Vec<_> = query(&conn, &LogQuery::default())
            .unwrap()
            .iter()
            .map(|e| e.duration_ms)
            .collect();
        assert_eq!(left, vec![5, 4, 3]);
    }

    #[test]
    fn test_delete_oldest_bytes() {
        let conn = open();
        let t0 = base_time();
        for i in 0..4 {
            let e = RecognitionLogEntry::new(ResultKind::NoFace, i)
                .at(t0 + Duration::seconds(i as i64))
                .with_image(vec![0u8; 904]);
            insert(&conn, &e).unwrap();
        }
        // Each row is 1000 bytes; freeing 1500 removes the two oldest.
        let (rows, freed) = delete_oldest_bytes(&conn, 1500).unwrap();
        assert_eq!((rows, freed), (2, 2000));
        assert_eq!(stats(&conn).unwrap().entries, 2);
    }

    #[test]
    fn test_delete_older_than() {
        let conn = open();
        let t0 = base_time();
        for i in 0..5 {
            let at = t0 + Duration::days(i as i64);
            insert(&conn, &RecognitionLogEntry::new(ResultKind::NoFace, i).at(at)).unwrap();
        }
        assert_eq!(delete_older_than(&conn, t0 + Duration::days(2)).unwrap(), 2);
        assert_eq!(stats(&conn).unwrap().oldest, Some(t0 + Duration::days(2)));
    }
}
