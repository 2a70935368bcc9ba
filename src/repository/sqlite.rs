//! SQLite-backed phrase store and snapshot table.
//! One connection behind a mutex; transactions use BEGIN IMMEDIATE so
//! concurrent upserts of the same (locale, text) serialize.
//! Nearest-neighbor search is a cosine scan over the filtered rows.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use super::{
    NearestQuery, Neighbor, PhraseRepository, PhraseTxn, Predicate, TopQuery, TxnWork, VectorField,
    WriteOp,
};
use crate::config::LocaleTable;
use crate::error::RepoError;
use crate::model::{CacheSnapshot, Embedding, Phrase, PhraseId, Polarity, TranslatedMap};
use crate::scoring::cosine;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS phrases (
        id TEXT PRIMARY KEY,
        text TEXT NOT NULL,
        locale TEXT NOT NULL,
        language TEXT NOT NULL,
        country TEXT NOT NULL,
        region TEXT NOT NULL,
        is_slang INTEGER NOT NULL DEFAULT 0,
        is_question INTEGER NOT NULL DEFAULT 0,
        usage_count INTEGER NOT NULL DEFAULT 0,
        literal_embedding BLOB,
        intent_embedding BLOB,
        logical_polarity TEXT,
        semantic_anchor TEXT,
        translated TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_phrases_locale_text
        ON phrases(locale, text);
    CREATE INDEX IF NOT EXISTS idx_phrases_locale_usage
        ON phrases(locale, is_slang, usage_count);
    CREATE TABLE IF NOT EXISTS cache_snapshots (
        locale TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );";

const COLUMNS: &str = "id, text, locale, language, country, region, is_slang, is_question,
    usage_count, literal_embedding, intent_embedding, logical_polarity, semantic_anchor,
    translated, created_at";

/// SQLite phrase repository.
pub struct SqlitePhraseStore {
    conn: Mutex<Connection>,
    /// Locale codes used to expand legacy boolean `translated` values.
    known_locales: Vec<String>,
}

impl SqlitePhraseStore {
    /// Open (or create) the phrase database at the given path.
    pub fn open(db_path: &Path, locales: &LocaleTable) -> Result<Self, RepoError> {
        let conn = Connection::open(db_path)?;
        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::init(conn, locales)?;
        info!(path = %db_path.display(), "phrase store opened");
        Ok(store)
    }

    /// Private in-memory database.
    pub fn open_in_memory(locales: &LocaleTable) -> Result<Self, RepoError> {
        Self::init(Connection::open_in_memory()?, locales)
    }

    fn init(conn: Connection, locales: &LocaleTable) -> Result<Self, RepoError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            known_locales: locales.codes(),
        })
    }

    /// Number of stored phrases, optionally restricted to one locale.
    pub fn count(&self, locale: Option<&str>) -> Result<usize, RepoError> {
        let conn = self.conn.lock();
        let n: i64 = match locale {
            Some(loc) => conn.query_row(
                "SELECT COUNT(*) FROM phrases WHERE locale = ?1",
                params![loc],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM phrases", [], |row| row.get(0))?,
        };
        Ok(n as usize)
    }

    /// Store a raw `translated` column value, bypassing normalization.
    /// Lets callers import documents written in the legacy boolean shape.
    pub fn import_translated_raw(&self, id: &PhraseId, raw_json: &str) -> Result<(), RepoError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE phrases SET translated = ?2 WHERE id = ?1",
            params![id.as_str(), raw_json],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PhraseRepository for SqlitePhraseStore {
    async fn get(&self, id: &PhraseId) -> Result<Option<Phrase>, RepoError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {COLUMNS} FROM phrases WHERE id = ?1");
        let phrase = conn
            .query_row(&sql, params![id.as_str()], |row| {
                row_to_phrase(row, &self.known_locales)
            })
            .optional()?;
        Ok(phrase)
    }

    async fn find_exact(&self, locale: &str, text: &str) -> Result<Option<Phrase>, RepoError> {
        let conn = self.conn.lock();
        select_exact(&conn, &self.known_locales, locale, text)
    }

    async fn find_nearest(&self, query: &NearestQuery<'_>) -> Result<Vec<Neighbor>, RepoError> {
        if query.k == 0 {
            return Ok(Vec::new());
        }
        let column = match query.field {
            VectorField::Literal => "literal_embedding",
            VectorField::Intent => "intent_embedding",
        };

        let mut sql = format!("SELECT {COLUMNS} FROM phrases WHERE {column} IS NOT NULL");
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(loc) = query.locale {
            args.push(SqlValue::Text(loc.to_string()));
            sql.push_str(&format!(" AND locale = ?{}", args.len()));
        }
        for pred in &query.filters {
            let (col, v) = match *pred {
                Predicate::IsSlang(v) => ("is_slang", v),
                Predicate::IsQuestion(v) => ("is_question", v),
            };
            args.push(SqlValue::Integer(v as i64));
            sql.push_str(&format!(" AND {col} = ?{}", args.len()));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            row_to_phrase(row, &self.known_locales)
        })?;

        let mut hits = Vec::new();
        for phrase in rows {
            let phrase = phrase?;
            let stored = match query.field {
                VectorField::Literal => phrase.literal_embedding.as_ref(),
                VectorField::Intent => phrase.intent_embedding.as_ref(),
            };
            if let Some(v) = stored {
                let distance = 1.0 - cosine(query.vector.as_slice(), v.as_slice());
                hits.push((distance, phrase));
            }
        }
        hits.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        hits.truncate(query.k);

        debug!(field = column, locale = ?query.locale, hits = hits.len(), "nearest search");
        Ok(hits
            .into_iter()
            .map(|(distance, phrase)| Neighbor {
                phrase,
                distance: Some(distance),
            })
            .collect())
    }

    async fn top_phrases(&self, query: &TopQuery<'_>) -> Result<Vec<Phrase>, RepoError> {
        let mut sql = format!("SELECT {COLUMNS} FROM phrases WHERE 1 = 1");
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(loc) = query.locale {
            args.push(SqlValue::Text(loc.to_string()));
            sql.push_str(&format!(" AND locale = ?{}", args.len()));
        }
        if !query.include_slang {
            sql.push_str(" AND is_slang = 0");
        }
        args.push(SqlValue::Integer(query.limit as i64));
        sql.push_str(&format!(
            " ORDER BY usage_count DESC, created_at ASC, rowid ASC LIMIT ?{}",
            args.len()
        ));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            row_to_phrase(row, &self.known_locales)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_locale(&self, locale: &str) -> Result<Vec<Phrase>, RepoError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM phrases WHERE locale = ?1 ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![locale], |row| {
            row_to_phrase(row, &self.known_locales)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn run_transaction(&self, work: &mut TxnWork<'_>) -> Result<(), RepoError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut handle = SqliteTxn {
                conn: &tx,
                known_locales: &self.known_locales,
            };
            // Dropping `tx` on error rolls back.
            work(&mut handle)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), RepoError> {
        if ops.is_empty() {
            return Ok(());
        }
        let start = std::time::Instant::now();
        let count = ops.len();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for op in &ops {
            apply_op(&tx, &self.known_locales, op)?;
        }
        tx.commit()?;

        debug!(
            count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "batch committed"
        );
        Ok(())
    }

    async fn get_snapshot(&self, locale: &str) -> Result<Option<CacheSnapshot>, RepoError> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM cache_snapshots WHERE locale = ?1",
                params![locale],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }
}

/// Transaction handle passed to `run_transaction` bodies.
struct SqliteTxn<'a> {
    conn: &'a Connection,
    known_locales: &'a [String],
}

impl PhraseTxn for SqliteTxn<'_> {
    fn find_exact(&mut self, locale: &str, text: &str) -> Result<Option<Phrase>, RepoError> {
        select_exact(self.conn, self.known_locales, locale, text)
    }

    fn insert(&mut self, phrase: &Phrase) -> Result<(), RepoError> {
        upsert_phrase(self.conn, phrase)
    }

    fn increment_usage(&mut self, id: &PhraseId, by: u64) -> Result<(), RepoError> {
        increment_usage(self.conn, id, by)
    }
}

fn select_exact(
    conn: &Connection,
    known_locales: &[String],
    locale: &str,
    text: &str,
) -> Result<Option<Phrase>, RepoError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM phrases WHERE locale = ?1 AND text = ?2
         ORDER BY created_at ASC, rowid ASC LIMIT 1"
    );
    let phrase = conn
        .query_row(&sql, params![locale, text], |row| {
            row_to_phrase(row, known_locales)
        })
        .optional()?;
    Ok(phrase)
}

fn upsert_phrase(conn: &Connection, p: &Phrase) -> Result<(), RepoError> {
    let translated = serde_json::to_string(&p.translated)?;
    conn.execute(
        "INSERT INTO phrases
         (id, text, locale, language, country, region, is_slang, is_question,
          usage_count, literal_embedding, intent_embedding, logical_polarity,
          semantic_anchor, translated, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(id) DO UPDATE SET
            text = excluded.text,
            locale = excluded.locale,
            language = excluded.language,
            country = excluded.country,
            region = excluded.region,
            is_slang = excluded.is_slang,
            is_question = excluded.is_question,
            usage_count = MAX(phrases.usage_count, excluded.usage_count),
            literal_embedding = excluded.literal_embedding,
            intent_embedding = excluded.intent_embedding,
            logical_polarity = excluded.logical_polarity,
            semantic_anchor = excluded.semantic_anchor,
            translated = excluded.translated",
        params![
            p.id.as_str(),
            p.text,
            p.locale,
            p.language,
            p.country,
            p.region,
            p.is_slang as i32,
            p.is_question as i32,
            p.usage_count as i64,
            p.literal_embedding.as_ref().map(Embedding::to_le_bytes),
            p.intent_embedding.as_ref().map(Embedding::to_le_bytes),
            p.logical_polarity.map(Polarity::as_str),
            p.semantic_anchor,
            translated,
            p.created_at,
        ],
    )?;
    Ok(())
}

fn increment_usage(conn: &Connection, id: &PhraseId, by: u64) -> Result<(), RepoError> {
    let changed = conn.execute(
        "UPDATE phrases SET usage_count = usage_count + ?2 WHERE id = ?1",
        params![id.as_str(), by as i64],
    )?;
    if changed == 0 {
        return Err(RepoError::NotFound(id.to_string()));
    }
    Ok(())
}

fn apply_op(conn: &Connection, known_locales: &[String], op: &WriteOp) -> Result<(), RepoError> {
    match op {
        WriteOp::Upsert(phrase) => upsert_phrase(conn, phrase),
        WriteOp::Delete(id) => {
            conn.execute("DELETE FROM phrases WHERE id = ?1", params![id.as_str()])?;
            Ok(())
        }
        WriteOp::IncrementUsage { id, by } => increment_usage(conn, id, *by),
        WriteOp::MarkTranslated { id, locale } => {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT translated FROM phrases WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let raw = raw.ok_or_else(|| RepoError::NotFound(id.to_string()))?;
            let mut map = parse_translated(&raw, known_locales);
            map.mark(locale);
            conn.execute(
                "UPDATE phrases SET translated = ?2 WHERE id = ?1",
                params![id.as_str(), serde_json::to_string(&map)?],
            )?;
            Ok(())
        }
        WriteOp::SetSemantics {
            id,
            polarity,
            semantic_anchor,
            intent_embedding,
        } => {
            let changed = conn.execute(
                "UPDATE phrases SET
                    logical_polarity = COALESCE(?2, logical_polarity),
                    semantic_anchor = COALESCE(?3, semantic_anchor),
                    intent_embedding = COALESCE(?4, intent_embedding)
                 WHERE id = ?1",
                params![
                    id.as_str(),
                    polarity.map(Polarity::as_str),
                    semantic_anchor,
                    intent_embedding.as_ref().map(Embedding::to_le_bytes),
                ],
            )?;
            if changed == 0 {
                return Err(RepoError::NotFound(id.to_string()));
            }
            Ok(())
        }
        WriteOp::SetQuestion { id, is_question } => {
            conn.execute(
                "UPDATE phrases SET is_question = ?2 WHERE id = ?1",
                params![id.as_str(), *is_question as i32],
            )?;
            Ok(())
        }
        WriteOp::PutSnapshot(snapshot) => {
            conn.execute(
                "INSERT OR REPLACE INTO cache_snapshots (locale, body, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    snapshot.locale,
                    serde_json::to_string(snapshot)?,
                    snapshot.updated_at
                ],
            )?;
            Ok(())
        }
        WriteOp::DeleteSnapshot(locale) => {
            conn.execute(
                "DELETE FROM cache_snapshots WHERE locale = ?1",
                params![locale],
            )?;
            Ok(())
        }
    }
}

/// Single place where the stored `translated` column is interpreted.
fn parse_translated(raw: &str, known_locales: &[String]) -> TranslatedMap {
    let value = serde_json::from_str(raw).unwrap_or(serde_json::Value::Null);
    TranslatedMap::from_stored(&value, known_locales)
}

fn row_to_phrase(row: &Row<'_>, known_locales: &[String]) -> rusqlite::Result<Phrase> {
    let embedding = |bytes: Option<Vec<u8>>| {
        bytes
            .filter(|b| !b.is_empty())
            .map(|b| Embedding::from_le_bytes(&b))
    };
    let polarity: Option<String> = row.get(11)?;
    let translated: String = row.get(13)?;
    let usage: i64 = row.get(8)?;

    Ok(Phrase {
        id: PhraseId::from(row.get::<_, String>(0)?),
        text: row.get(1)?,
        locale: row.get(2)?,
        language: row.get(3)?,
        country: row.get(4)?,
        region: row.get(5)?,
        is_slang: row.get::<_, i32>(6)? != 0,
        is_question: row.get::<_, i32>(7)? != 0,
        usage_count: usage.max(0) as u64,
        literal_embedding: embedding(row.get(9)?),
        intent_embedding: embedding(row.get(10)?),
        logical_polarity: polarity.as_deref().and_then(Polarity::parse_loose),
        semantic_anchor: row.get(12)?,
        translated: parse_translated(&translated, known_locales),
        created_at: row.get(14)?,
    })
}
