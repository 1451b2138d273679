use std::path::Path;

use anyhow::{bail, Context, Result};
use fxhash::FxHashSet;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};

const SCHEMA: &str = "
CREATE TABLE files (
    id INTEGER PRIMARY KEY,
    path TEXT UNIQUE NOT NULL,
    icon TEXT NOT NULL
);
CREATE TABLE trg_index (
    id INTEGER PRIMARY KEY REFERENCES files (id),
    text TEXT NOT NULL
);
CREATE TABLE trg_trigrams (
    trigram TEXT NOT NULL,
    id INTEGER NOT NULL
);
CREATE INDEX trg_trigrams_by_trigram ON trg_trigrams (trigram, id);
";

/// The per-tree index store: the `files` table plus the trigram-backed
/// full-text side of it. A single writable connection exists during
/// indexing; decoration workers each open their own read-only view.
pub struct Storage {
    conn: Connection,
}

#[derive(Debug)]
pub struct FileRow {
    pub id: i64,
    pub path: String,
    pub icon: String,
    pub text: String,
}

/// One identifier occurrence matched by a wildcard search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub file_id: i64,
    pub line: usize,
    pub identifier: String,
}

impl Storage {
    pub fn create(path: &Path) -> Result<Storage> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening index store at {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("creating index tables")?;
        Ok(Storage { conn })
    }

    pub fn open_read_only(path: &Path) -> Result<Storage> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("opening index store at {}", path.display()))?;
        Ok(Storage { conn })
    }

    /// The raw connection, for plugin post-process hooks that maintain their
    /// own auxiliary tables.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Insert a file record and hand back its freshly assigned id.
    pub fn add_file(&self, path: &str, icon: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO files (path, icon) VALUES (?1, ?2)",
                params![path, icon],
            )
            .with_context(|| format!("inserting file record for {path}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Store a file's decoded text and its distinct trigrams.
    pub fn add_text(&self, id: i64, text: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO trg_index (id, text) VALUES (?1, ?2)",
            params![id, text],
        )?;
        let mut insert = self
            .conn
            .prepare_cached("INSERT INTO trg_trigrams (trigram, id) VALUES (?1, ?2)")?;
        for trigram in trigrams(text) {
            insert.execute(params![trigram, id])?;
        }
        Ok(())
    }

    pub fn max_file_id(&self) -> Result<i64> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM files", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    /// Fetch the documents in an id range, ascending, for a decoration
    /// worker.
    pub fn files_in_range(&self, start: i64, end: i64) -> Result<Vec<FileRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT files.id, files.path, files.icon, trg_index.text
             FROM trg_index JOIN files ON trg_index.id = files.id
             WHERE files.id >= ?1 AND files.id <= ?2
             ORDER BY files.id",
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok(FileRow {
                id: row.get(0)?,
                path: row.get(1)?,
                icon: row.get(2)?,
                text: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Build statistics for the query planner and verify store integrity.
    pub fn finalize(&self) -> Result<()> {
        self.conn.execute_batch("ANALYZE")?;
        let verdict: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            bail!("index store integrity check failed: {verdict}");
        }
        Ok(())
    }

    /// Find identifier occurrences matching a wildcard pattern, in file
    /// order. `*` matches any run, `?` exactly one character; everything
    /// else, underscore included, is literal. Literal runs of three or more
    /// characters prefilter candidate files through the trigram table.
    pub fn search(&self, pattern: &str) -> Result<Vec<SearchHit>> {
        let matcher = wildcard_to_regex(pattern)?;
        let needed: Vec<String> = literal_trigrams(pattern).into_iter().collect();

        let candidates: Vec<i64> = if needed.is_empty() {
            let mut stmt = self.conn.prepare("SELECT id FROM trg_index ORDER BY id")?;
            let ids = stmt.query_map([], |row| row.get(0))?;
            ids.collect::<rusqlite::Result<_>>()?
        } else {
            let placeholders = vec!["?"; needed.len()].join(", ");
            let sql = format!(
                "SELECT id FROM trg_trigrams WHERE trigram IN ({placeholders})
                 GROUP BY id HAVING COUNT(*) = {} ORDER BY id",
                needed.len()
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let ids = stmt.query_map(params_from_iter(needed.iter()), |row| row.get(0))?;
            ids.collect::<rusqlite::Result<_>>()?
        };

        let mut hits = Vec::new();
        for id in candidates {
            let text: String = self.conn.query_row(
                "SELECT text FROM trg_index WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            let mut line_starts = vec![0usize];
            line_starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
            for m in IDENTIFIER.find_iter(&text) {
                if matcher.is_match(m.as_str()) {
                    let line = line_starts.partition_point(|&s| s <= m.start());
                    hits.push(SearchHit {
                        file_id: id,
                        line,
                        identifier: m.as_str().to_string(),
                    });
                }
            }
        }
        Ok(hits)
    }
}

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*").unwrap());

/// Distinct character trigrams of a text.
fn trigrams(text: &str) -> FxHashSet<String> {
    let indices: Vec<(usize, char)> = text.char_indices().collect();
    let mut out = FxHashSet::default();
    for window in indices.windows(3) {
        let start = window[0].0;
        let end = window[2].0 + window[2].1.len_utf8();
        out.insert(text[start..end].to_string());
    }
    out
}

/// Trigrams every match of the pattern must contain: those of its literal
/// runs between wildcards.
fn literal_trigrams(pattern: &str) -> FxHashSet<String> {
    pattern
        .split(['*', '?'])
        .flat_map(|fragment| trigrams(fragment))
        .collect()
}

/// Translate a wildcard pattern into an anchored regex matched against whole
/// identifier tokens.
fn wildcard_to_regex(pattern: &str) -> Result<Regex> {
    let mut translated = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            c => translated.push_str(&regex::escape(&c.to_string())),
        }
    }
    translated.push('$');
    Regex::new(&translated).with_context(|| format!("compiling wildcard pattern '{pattern}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let store = Storage::create(&dir.path().join("index.sqlite")).unwrap();
        (dir, store)
    }

    const WILDCARD_SOURCE: &str = "\
int get_foo() {
    return 0;
}

int get_bar() {
    return 0;
}

int getX() {
    return 0;
}
";

    #[test]
    fn ids_are_dense_and_start_at_one() {
        let (_dir, store) = scratch_store();
        assert_eq!(store.max_file_id().unwrap(), 0);
        assert_eq!(store.add_file("a.c", "code").unwrap(), 1);
        assert_eq!(store.add_file("b.c", "code").unwrap(), 2);
        assert_eq!(store.add_file("c.c", "code").unwrap(), 3);
        assert_eq!(store.max_file_id().unwrap(), 3);
    }

    #[test]
    fn range_reads_come_back_in_id_order() {
        let (_dir, store) = scratch_store();
        for name in ["one.c", "two.c", "three.c"] {
            let id = store.add_file(name, "code").unwrap();
            store.add_text(id, name).unwrap();
        }
        let rows = store.files_in_range(1, 2).unwrap();
        let got: Vec<(i64, &str)> = rows.iter().map(|r| (r.id, r.path.as_str())).collect();
        assert_eq!(got, [(1, "one.c"), (2, "two.c")]);
    }

    #[test]
    fn asterisk_matches_identifier_runs() {
        let (_dir, store) = scratch_store();
        let id = store.add_file("main.c", "code").unwrap();
        store.add_text(id, WILDCARD_SOURCE).unwrap();
        let hits = store.search("get*").unwrap();
        let idents: Vec<&str> = hits.iter().map(|h| h.identifier.as_str()).collect();
        assert_eq!(idents, ["get_foo", "get_bar", "getX"]);
        assert_eq!(hits[0].line, 1);
        assert_eq!(hits[1].line, 5);
    }

    #[test]
    fn question_mark_matches_exactly_one_character() {
        let (_dir, store) = scratch_store();
        let id = store.add_file("main.c", "code").unwrap();
        store.add_text(id, WILDCARD_SOURCE).unwrap();
        let hits = store.search("get_fo?").unwrap();
        let idents: Vec<&str> = hits.iter().map(|h| h.identifier.as_str()).collect();
        assert_eq!(idents, ["get_foo"]);
    }

    #[test]
    fn underscore_is_literal_not_a_wildcard() {
        let (_dir, store) = scratch_store();
        let id = store.add_file("main.c", "code").unwrap();
        store.add_text(id, WILDCARD_SOURCE).unwrap();
        assert!(store.search("get_").unwrap().is_empty());
    }

    #[test]
    fn trigram_prefilter_rules_out_absent_literals() {
        let (_dir, store) = scratch_store();
        let id = store.add_file("main.c", "code").unwrap();
        store.add_text(id, WILDCARD_SOURCE).unwrap();
        assert!(store.search("zzz*").unwrap().is_empty());
    }

    #[test]
    fn search_spans_files_in_id_order() {
        let (_dir, store) = scratch_store();
        for (name, text) in [("b.c", "int get_two() {}\n"), ("a.c", "int get_one() {}\n")] {
            let id = store.add_file(name, "code").unwrap();
            store.add_text(id, text).unwrap();
        }
        let hits = store.search("get*").unwrap();
        let idents: Vec<&str> = hits.iter().map(|h| h.identifier.as_str()).collect();
        assert_eq!(idents, ["get_two", "get_one"]);
    }

    #[test]
    fn finalize_passes_on_a_healthy_store() {
        let (_dir, store) = scratch_store();
        let id = store.add_file("a.c", "code").unwrap();
        store.add_text(id, "hello\n").unwrap();
        store.finalize().unwrap();
    }
}
