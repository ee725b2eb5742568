//! Read-only view of the hub's CRUD data (projects, tasks, notes, bills,
//! sensors, KPI datasets, documents), as consumed by the local summarizer.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub title: String,
    pub description: String,
    pub status: String,
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillRecord {
    pub name: String,
    pub amount: f64,
    pub due_date: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub name: String,
    pub status: String,
    pub last_value: Option<f64>,
    pub unit: String,
    pub location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub name: String,
    pub status: String,
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KpiRecord {
    pub dataset: String,
    pub label: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_id: i64,
    pub title: String,
    pub excerpt: String,
}

/**
 * \brief Read access to the CRUD collaborators. Implementations never write.
 */
pub trait Workspace: Send + Sync {
    fn projects(&self) -> Result<Vec<ProjectRecord>>;
    fn tasks(&self) -> Result<Vec<TaskRecord>>;
    fn notes(&self) -> Result<Vec<NoteRecord>>;
    fn bills(&self) -> Result<Vec<BillRecord>>;
    fn sensors(&self) -> Result<Vec<SensorRecord>>;
    fn kpis(&self) -> Result<Vec<KpiRecord>>;
    /** \brief Documents matching any of `keywords`. */
    fn search(&self, keywords: &[String]) -> Result<Vec<SearchHit>>;
}

/**
 * \brief Fixed snapshot held in memory; also what an empty hub looks like.
 */
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkspace {
    pub projects: Vec<ProjectRecord>,
    pub tasks: Vec<TaskRecord>,
    pub notes: Vec<NoteRecord>,
    pub bills: Vec<BillRecord>,
    pub sensors: Vec<SensorRecord>,
    pub kpis: Vec<KpiRecord>,
    /** \brief `(doc_id, title, body)` triples for keyword search. */
    pub documents: Vec<(i64, String, String)>,
}

impl Workspace for MemoryWorkspace {
    fn projects(&self) -> Result<Vec<ProjectRecord>> {
        Ok(self.projects.clone())
    }

    fn tasks(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.tasks.clone())
    }

    fn notes(&self) -> Result<Vec<NoteRecord>> {
        Ok(self.notes.clone())
    }

    fn bills(&self) -> Result<Vec<BillRecord>> {
        Ok(self.bills.clone())
    }

    fn sensors(&self) -> Result<Vec<SensorRecord>> {
        Ok(self.sensors.clone())
    }

    fn kpis(&self) -> Result<Vec<KpiRecord>> {
        Ok(self.kpis.clone())
    }

    fn search(&self, keywords: &[String]) -> Result<Vec<SearchHit>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .documents
            .iter()
            .filter(|(_, title, body)| {
                let haystack = format!("{} {}", title, body).to_lowercase();
                keywords.iter().any(|k| haystack.contains(k.as_str()))
            })
            .map(|(id, title, body)| SearchHit {
                doc_id: *id,
                title: title.clone(),
                excerpt: crate::models::clip(body, 200),
            })
            .collect())
    }
}

/** \brief Upper bound on search hits returned per query. */
const SEARCH_LIMIT: usize = 10;

/**
 * \brief Collaborator tables living in the hub database.
 */
pub struct SqliteWorkspace {
    conn: Mutex<Connection>,
}

impl SqliteWorkspace {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("workspace connection poisoned"))?;
        Ok(f(&conn)?)
    }
}

/**
 * \brief Creates the collaborator tables when the hub database is brand new.
 * \details The CRUD surfaces own these tables; this only guarantees that reads
 * succeed on a fresh file.
 */
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            due_date TEXT
        );
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'open',
            due_date TEXT
        );
        CREATE TABLE IF NOT EXISTS notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS bills (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            amount REAL NOT NULL DEFAULT 0,
            due_date TEXT,
            status TEXT NOT NULL DEFAULT 'unpaid'
        );
        CREATE TABLE IF NOT EXISTS sensors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ok',
            last_value REAL,
            unit TEXT NOT NULL DEFAULT '',
            location TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS kpis (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dataset TEXT NOT NULL,
            label TEXT NOT NULL,
            value REAL NOT NULL DEFAULT 0,
            unit TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            body TEXT NOT NULL DEFAULT ''
        );
        "#,
    )?;
    Ok(())
}

impl Workspace for SqliteWorkspace {
    fn projects(&self) -> Result<Vec<ProjectRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name, status, due_date FROM projects ORDER BY id ASC")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ProjectRecord {
                        name: row.get(0)?,
                        status: row.get(1)?,
                        due_date: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn tasks(&self) -> Result<Vec<TaskRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT title, description, status, due_date FROM tasks ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(TaskRecord {
                        title: row.get(0)?,
                        description: row.get(1)?,
                        status: row.get(2)?,
                        due_date: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn notes(&self) -> Result<Vec<NoteRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT title, content FROM notes ORDER BY id ASC")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(NoteRecord {
                        title: row.get(0)?,
                        content: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn bills(&self) -> Result<Vec<BillRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name, amount, due_date, status FROM bills ORDER BY id ASC")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(BillRecord {
                        name: row.get(0)?,
                        amount: row.get(1)?,
                        due_date: row.get(2)?,
                        status: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn sensors(&self) -> Result<Vec<SensorRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, status, last_value, unit, location FROM sensors ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(SensorRecord {
                        name: row.get(0)?,
                        status: row.get(1)?,
                        last_value: row.get(2)?,
                        unit: row.get(3)?,
                        location: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn kpis(&self) -> Result<Vec<KpiRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT dataset, label, value, unit FROM kpis ORDER BY id ASC")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(KpiRecord {
                        dataset: row.get(0)?,
                        label: row.get(1)?,
                        value: row.get(2)?,
                        unit: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn search(&self, keywords: &[String]) -> Result<Vec<SearchHit>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let clause = (1..=keywords.len())
            .map(|i| format!("lower(title || ' ' || body) LIKE ?{}", i))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT id, title, body FROM documents WHERE {} ORDER BY id ASC LIMIT {}",
            clause, SEARCH_LIMIT
        );
        let patterns = keywords
            .iter()
            .map(|k| format!("%{}%", k.replace('%', "").replace('_', "")))
            .collect::<Vec<_>>();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(patterns.iter()), |row| {
                    let body: String = row.get(2)?;
                    Ok(SearchHit {
                        doc_id: row.get(0)?,
                        title: row.get(1)?,
                        excerpt: crate::models::clip(&body, 200),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SqliteWorkspace {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        ensure_schema(&conn).expect("schema");
        conn.execute_batch(
            r#"
            INSERT INTO tasks (title, description, status, due_date)
                VALUES ('Renew passport', 'book appointment', 'open', '2026-11-01');
            INSERT INTO bills (name, amount, due_date, status)
                VALUES ('Electricity', 82.5, '2026-10-21', 'unpaid');
            INSERT INTO sensors (name, status, last_value, unit, location)
                VALUES ('Garage temp', 'warning', 41.0, 'C', 'garage');
            INSERT INTO documents (title, body) VALUES ('Router manual', 'reset the router by holding');
            INSERT INTO documents (title, body) VALUES ('Recipes', 'pancakes');
            "#,
        )
        .expect("seed");
        SqliteWorkspace::new(conn)
    }

    #[test]
    fn test_reads_seeded_rows() {
        let ws = seeded();
        assert_eq!(ws.tasks().expect("tasks")[0].title, "Renew passport");
        assert_eq!(ws.bills().expect("bills")[0].amount, 82.5);
        assert_eq!(ws.sensors().expect("sensors")[0].last_value, Some(41.0));
        assert!(ws.notes().expect("notes").is_empty());
        assert!(ws.projects().expect("projects").is_empty());
    }

    #[test]
    fn test_search_is_an_or_query() {
        let ws = seeded();
        let hits = ws
            .search(&["router".to_string(), "pancakes".to_string()])
            .expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Router manual");
        assert!(ws.search(&[]).expect("empty").is_empty());
        assert!(ws.search(&["zzzz".to_string()]).expect("miss").is_empty());
    }

    #[test]
    fn test_memory_search_matches_case_insensitively() {
        let ws = MemoryWorkspace {
            documents: vec![(7, "Boiler Service".to_string(), "annual check".to_string())],
            ..Default::default()
        };
        let hits = ws.search(&["boiler".to_string()]).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, 7);
    }
}
