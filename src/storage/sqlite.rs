//! SQLite storage backend

use super::blob::{decode_vector, encode_vector};
use super::traits::{
    CorpusUnit, EmbeddingRow, ModelRow, NewUnit, OpenStore, PipelineStore, PlotRow, Project,
    ProjectId, ReducedRow, StorageError, StorageResult, TrainingRow, UnitId,
};
use crate::config::ProjectConfig;
use crate::lineage::Stage;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed pipeline store
///
/// One database file holds projects, units, model identity rows and the
/// three derived tables. Derived rows reference their upstream row and their
/// model row with `ON DELETE CASCADE`, so deleting a unit, an identity or an
/// upstream row removes everything built on it.
/// Thread-safe via internal mutex on the connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Todo queries, one anti-join per stage.
const TODO_UNITS: &str = r#"
    SELECT u.id, u.project_id, u.position, u.text, u.label
    FROM units u
    WHERE u.project_id = ?1
      AND NOT EXISTS (
        SELECT 1 FROM embeddings e WHERE e.unit_id = u.id AND e.model_id = ?2
      )
    ORDER BY u.position, u.id
"#;

const TODO_EMBEDDINGS: &str = r#"
    SELECT e.id, e.unit_id, e.vector
    FROM embeddings e
    JOIN units u ON u.id = e.unit_id
    WHERE e.model_id = ?1
      AND NOT EXISTS (
        SELECT 1 FROM reduced r WHERE r.embedding_id = e.id AND r.model_id = ?2
      )
    ORDER BY u.position, u.id
"#;

const TODO_REDUCED: &str = r#"
    SELECT r.id, e.unit_id, r.x, r.y
    FROM reduced r
    JOIN embeddings e ON e.id = r.embedding_id
    JOIN units u ON u.id = e.unit_id
    WHERE r.model_id = ?1
      AND NOT EXISTS (
        SELECT 1 FROM clusters c WHERE c.reduced_id = r.id AND c.model_id = ?2
      )
    ORDER BY u.position, u.id
"#;

fn derived_table(stage: Stage) -> &'static str {
    match stage {
        Stage::Embedding => "embeddings",
        Stage::Reduction => "reduced",
        Stage::Clustering => "clusters",
    }
}

fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

impl SqliteStore {
    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                config_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS units (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                text TEXT NOT NULL,
                label TEXT,
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_units_project
                ON units(project_id, position);

            -- Model identity rows
            CREATE TABLE IF NOT EXISTS models (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                stage TEXT NOT NULL,
                hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (project_id, hash),
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS embeddings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                unit_id INTEGER NOT NULL,
                model_id INTEGER NOT NULL,
                vector BLOB NOT NULL,
                UNIQUE (unit_id, model_id),
                FOREIGN KEY (unit_id) REFERENCES units(id) ON DELETE CASCADE,
                FOREIGN KEY (model_id) REFERENCES models(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_model
                ON embeddings(model_id);

            CREATE TABLE IF NOT EXISTS reduced (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                embedding_id INTEGER NOT NULL,
                model_id INTEGER NOT NULL,
                x REAL NOT NULL,
                y REAL NOT NULL,
                UNIQUE (embedding_id, model_id),
                FOREIGN KEY (embedding_id) REFERENCES embeddings(id) ON DELETE CASCADE,
                FOREIGN KEY (model_id) REFERENCES models(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_reduced_model
                ON reduced(model_id);

            CREATE TABLE IF NOT EXISTS clusters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                reduced_id INTEGER NOT NULL,
                model_id INTEGER NOT NULL,
                label INTEGER NOT NULL,
                UNIQUE (reduced_id, model_id),
                FOREIGN KEY (reduced_id) REFERENCES reduced(id) ON DELETE CASCADE,
                FOREIGN KEY (model_id) REFERENCES models(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_clusters_model
                ON clusters(model_id);

            PRAGMA foreign_keys = ON;

            -- Readers (plot, stats) proceed while a stage pass is writing
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn row_to_project(
        id: i64,
        name: String,
        config_json: String,
        created_at: String,
    ) -> StorageResult<Project> {
        Ok(Project {
            id: ProjectId(id),
            name,
            config: serde_json::from_str(&config_json)?,
            created_at: parse_timestamp(&created_at)?,
        })
    }

    fn row_to_model(
        id: i64,
        project_id: i64,
        stage: String,
        hash: String,
        created_at: String,
    ) -> StorageResult<ModelRow> {
        let stage = stage
            .parse::<Stage>()
            .map_err(StorageError::Corrupt)?;
        Ok(ModelRow {
            id,
            project: ProjectId(project_id),
            stage,
            hash,
            created_at: parse_timestamp(&created_at)?,
        })
    }

    fn map_unit(row: &rusqlite::Row<'_>) -> rusqlite::Result<CorpusUnit> {
        Ok(CorpusUnit {
            id: UnitId(row.get(0)?),
            project: ProjectId(row.get(1)?),
            position: row.get(2)?,
            text: row.get(3)?,
            label: row.get(4)?,
        })
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl PipelineStore for SqliteStore {
    // === Project Operations ===

    fn create_project(&self, name: &str, config: &ProjectConfig) -> StorageResult<Project> {
        let conn = self.conn()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO projects (name, config_json, created_at) VALUES (?1, ?2, ?3)",
            params![name, serde_json::to_string(config)?, created_at.to_rfc3339()],
        )?;
        Ok(Project {
            id: ProjectId(conn.last_insert_rowid()),
            name: name.to_string(),
            config: config.clone(),
            created_at,
        })
    }

    fn load_project(&self, id: ProjectId) -> StorageResult<Option<Project>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, config_json, created_at FROM projects WHERE id = ?1",
                params![id.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match row {
            Some((id, name, config_json, created_at)) => {
                Ok(Some(Self::row_to_project(id, name, config_json, created_at)?))
            }
            None => Ok(None),
        }
    }

    fn list_projects(&self) -> StorageResult<Vec<Project>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, config_json, created_at FROM projects ORDER BY id")?;
        let rows: Vec<(i64, String, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<Result<_, _>>()?;

        rows.into_iter()
            .map(|(id, name, config_json, created_at)| {
                Self::row_to_project(id, name, config_json, created_at)
            })
            .collect()
    }

    fn update_config(&self, id: ProjectId, config: &ProjectConfig) -> StorageResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE projects SET config_json = ?2 WHERE id = ?1",
            params![id.0, serde_json::to_string(config)?],
        )?;
        Ok(updated > 0)
    }

    fn delete_project(&self, id: ProjectId) -> StorageResult<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM projects WHERE id = ?1", params![id.0])?;
        Ok(deleted > 0)
    }

    // === Unit Operations ===

    fn add_units(&self, project: ProjectId, units: &[NewUnit]) -> StorageResult<Vec<UnitId>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(units.len());
        {
            let start: i64 = tx.query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM units WHERE project_id = ?1",
                params![project.0],
                |row| row.get(0),
            )?;
            let mut stmt = tx.prepare(
                "INSERT INTO units (project_id, position, text, label) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (offset, unit) in units.iter().enumerate() {
                stmt.execute(params![project.0, start + offset as i64, unit.text, unit.label])?;
                ids.push(UnitId(tx.last_insert_rowid()));
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    fn list_units(&self, project: ProjectId) -> StorageResult<Vec<CorpusUnit>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, position, text, label FROM units
             WHERE project_id = ?1 ORDER BY position, id",
        )?;
        let units = stmt
            .query_map(params![project.0], Self::map_unit)?
            .collect::<Result<_, _>>()?;
        Ok(units)
    }

    fn count_units(&self, project: ProjectId) -> StorageResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM units WHERE project_id = ?1",
            params![project.0],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn delete_unit(&self, unit: UnitId) -> StorageResult<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM units WHERE id = ?1", params![unit.0])?;
        Ok(deleted > 0)
    }

    fn relabel_unit(&self, unit: UnitId, label: Option<&str>) -> StorageResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE units SET label = ?2 WHERE id = ?1",
            params![unit.0, label],
        )?;
        Ok(updated > 0)
    }

    // === Model Identity Operations ===

    fn find_model(&self, project: ProjectId, hash: &str) -> StorageResult<Option<ModelRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, project_id, stage, hash, created_at FROM models
                 WHERE project_id = ?1 AND hash = ?2",
                params![project.0, hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        match row {
            Some((id, project_id, stage, hash, created_at)) => Ok(Some(Self::row_to_model(
                id, project_id, stage, hash, created_at,
            )?)),
            None => Ok(None),
        }
    }

    fn ensure_model(&self, project: ProjectId, stage: Stage, hash: &str) -> StorageResult<ModelRow> {
        let (id, project_id, stage, hash, created_at) = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO models (project_id, stage, hash, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(project_id, hash) DO NOTHING",
                params![project.0, stage.as_str(), hash, Utc::now().to_rfc3339()],
            )?;
            conn.query_row(
                "SELECT id, project_id, stage, hash, created_at FROM models
                 WHERE project_id = ?1 AND hash = ?2",
                params![project.0, hash],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )?
        };
        Self::row_to_model(id, project_id, stage, hash, created_at)
    }

    fn list_models(&self, project: ProjectId) -> StorageResult<Vec<ModelRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, stage, hash, created_at FROM models
             WHERE project_id = ?1 ORDER BY id",
        )?;
        let rows: Vec<(i64, i64, String, String, String)> = stmt
            .query_map(params![project.0], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<Result<_, _>>()?;

        rows.into_iter()
            .map(|(id, project_id, stage, hash, created_at)| {
                Self::row_to_model(id, project_id, stage, hash, created_at)
            })
            .collect()
    }

    fn delete_model(&self, model_id: i64) -> StorageResult<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM models WHERE id = ?1", params![model_id])?;
        Ok(deleted > 0)
    }

    // === Todo Resolution ===

    fn todo_units(&self, project: ProjectId, model_id: i64) -> StorageResult<Vec<CorpusUnit>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(TODO_UNITS)?;
        let units = stmt
            .query_map(params![project.0, model_id], Self::map_unit)?
            .collect::<Result<_, _>>()?;
        Ok(units)
    }

    fn todo_embeddings(&self, upstream_id: i64, model_id: i64) -> StorageResult<Vec<EmbeddingRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(TODO_EMBEDDINGS)?;
        let raw: Vec<(i64, i64, Vec<u8>)> = stmt
            .query_map(params![upstream_id, model_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;

        raw.into_iter()
            .map(|(id, unit, blob)| {
                Ok(EmbeddingRow {
                    id,
                    unit: UnitId(unit),
                    vector: decode_vector(&blob)?,
                })
            })
            .collect()
    }

    fn todo_reduced(&self, upstream_id: i64, model_id: i64) -> StorageResult<Vec<ReducedRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(TODO_REDUCED)?;
        let rows = stmt
            .query_map(params![upstream_id, model_id], |row| {
                Ok(ReducedRow {
                    id: row.get(0)?,
                    unit: UnitId(row.get(1)?),
                    position: [row.get::<_, f64>(2)? as f32, row.get::<_, f64>(3)? as f32],
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    // === Derived Rows ===

    fn insert_embeddings(&self, model_id: i64, rows: &[(UnitId, Vec<f32>)]) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO embeddings (unit_id, model_id, vector) VALUES (?1, ?2, ?3)",
            )?;
            for (unit, vector) in rows {
                stmt.execute(params![unit.0, model_id, encode_vector(vector)])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn insert_reduced(&self, model_id: i64, rows: &[(i64, [f32; 2])]) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO reduced (embedding_id, model_id, x, y) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (embedding_id, [x, y]) in rows {
                stmt.execute(params![embedding_id, model_id, *x as f64, *y as f64])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn insert_clusters(&self, model_id: i64, rows: &[(i64, i64)]) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO clusters (reduced_id, model_id, label) VALUES (?1, ?2, ?3)",
            )?;
            for (reduced_id, label) in rows {
                stmt.execute(params![reduced_id, model_id, label])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn count_derived(&self, stage: Stage, model_id: i64) -> StorageResult<usize> {
        let conn = self.conn()?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE model_id = ?1", derived_table(stage));
        let count: i64 = conn.query_row(&sql, params![model_id], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn delete_derived(&self, stage: Stage, model_id: i64) -> StorageResult<usize> {
        let conn = self.conn()?;
        let sql = format!("DELETE FROM {} WHERE model_id = ?1", derived_table(stage));
        Ok(conn.execute(&sql, params![model_id])?)
    }

    // === Views ===

    fn training_rows(&self, project: ProjectId, embedding_id: i64) -> StorageResult<Vec<TrainingRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT u.id, e.vector, u.label
             FROM units u
             JOIN embeddings e ON e.unit_id = u.id AND e.model_id = ?2
             WHERE u.project_id = ?1
             ORDER BY u.position, u.id",
        )?;
        let raw: Vec<(i64, Vec<u8>, Option<String>)> = stmt
            .query_map(params![project.0, embedding_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;

        raw.into_iter()
            .map(|(unit, blob, label)| {
                Ok(TrainingRow {
                    unit: UnitId(unit),
                    vector: decode_vector(&blob)?,
                    label,
                })
            })
            .collect()
    }

    fn plot(&self, reduction_id: i64, cluster_id: Option<i64>) -> StorageResult<Vec<PlotRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT u.id, u.text, u.label, r.x, r.y, c.label
             FROM reduced r
             JOIN embeddings e ON e.id = r.embedding_id
             JOIN units u ON u.id = e.unit_id
             LEFT JOIN clusters c ON c.reduced_id = r.id AND c.model_id = ?2
             WHERE r.model_id = ?1
             ORDER BY u.position, u.id",
        )?;
        let rows = stmt
            .query_map(params![reduction_id, cluster_id], |row| {
                Ok(PlotRow {
                    unit: UnitId(row.get(0)?),
                    text: row.get(1)?,
                    label: row.get(2)?,
                    x: row.get::<_, f64>(3)? as f32,
                    y: row.get::<_, f64>(4)? as f32,
                    cluster: row.get(5)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    fn cluster_counts(&self, cluster_id: i64) -> StorageResult<Vec<(i64, usize)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT label, COUNT(*) FROM clusters WHERE model_id = ?1 GROUP BY label ORDER BY label",
        )?;
        let counts = stmt
            .query_map(params![cluster_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<_, _>>()?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn create_test_project(store: &SqliteStore) -> Project {
        store
            .create_project("test-project", &ProjectConfig::default())
            .unwrap()
    }

    fn add_texts(store: &SqliteStore, project: ProjectId, texts: &[&str]) -> Vec<UnitId> {
        let units: Vec<NewUnit> = texts.iter().map(|t| NewUnit::new(*t)).collect();
        store.add_units(project, &units).unwrap()
    }

    #[test]
    fn test_create_and_load_project() {
        let store = create_test_store();
        let project = create_test_project(&store);

        let loaded = store.load_project(project.id).unwrap().unwrap();
        assert_eq!(loaded.name, "test-project");
        assert_eq!(loaded.config, ProjectConfig::default());
        assert!(store.load_project(ProjectId(999)).unwrap().is_none());
    }

    #[test]
    fn test_update_config() {
        let store = create_test_store();
        let project = create_test_project(&store);

        let mut config = ProjectConfig::default();
        config.name = "renamed".into();
        assert!(store.update_config(project.id, &config).unwrap());
        assert_eq!(store.load_project(project.id).unwrap().unwrap().config.name, "renamed");
        assert!(!store.update_config(ProjectId(999), &config).unwrap());
    }

    #[test]
    fn test_units_keep_ingestion_order_across_batches() {
        let store = create_test_store();
        let project = create_test_project(&store);
        add_texts(&store, project.id, &["a", "b"]);
        add_texts(&store, project.id, &["c"]);

        let units = store.list_units(project.id).unwrap();
        let texts: Vec<_> = units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert_eq!(units.iter().map(|u| u.position).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_ensure_model_is_idempotent() {
        let store = create_test_store();
        let project = create_test_project(&store);

        let first = store.ensure_model(project.id, Stage::Embedding, "embedding_x_1").unwrap();
        let second = store.ensure_model(project.id, Stage::Embedding, "embedding_x_1").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_models(project.id).unwrap().len(), 1);
        assert_eq!(
            store.find_model(project.id, "embedding_x_1").unwrap().unwrap().stage,
            Stage::Embedding
        );
    }

    #[test]
    fn test_todo_is_set_difference() {
        let store = create_test_store();
        let project = create_test_project(&store);
        let ids = add_texts(&store, project.id, &["a", "b", "c"]);
        let model = store.ensure_model(project.id, Stage::Embedding, "e1").unwrap();

        assert_eq!(store.todo_units(project.id, model.id).unwrap().len(), 3);

        store.insert_embeddings(model.id, &[(ids[1], vec![1.0, 2.0])]).unwrap();
        let todo: Vec<_> = store
            .todo_units(project.id, model.id)
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(todo, vec![ids[0], ids[2]]);

        // Adding a unit grows the todo set, other models are unaffected.
        let new = add_texts(&store, project.id, &["d"]);
        let todo = store.todo_units(project.id, model.id).unwrap();
        assert_eq!(todo.len(), 3);
        assert_eq!(todo[2].id, new[0]);

        let other = store.ensure_model(project.id, Stage::Embedding, "e2").unwrap();
        assert_eq!(store.todo_units(project.id, other.id).unwrap().len(), 4);
    }

    #[test]
    fn test_todo_embeddings_and_reduced() {
        let store = create_test_store();
        let project = create_test_project(&store);
        let ids = add_texts(&store, project.id, &["a", "b"]);
        let e = store.ensure_model(project.id, Stage::Embedding, "e").unwrap();
        let r = store.ensure_model(project.id, Stage::Reduction, "r").unwrap();
        let c = store.ensure_model(project.id, Stage::Clustering, "c").unwrap();

        store
            .insert_embeddings(e.id, &[(ids[0], vec![0.5; 4]), (ids[1], vec![0.25; 4])])
            .unwrap();
        let todo = store.todo_embeddings(e.id, r.id).unwrap();
        assert_eq!(todo.len(), 2);
        assert_eq!(todo[0].vector, vec![0.5; 4]);

        store.insert_reduced(r.id, &[(todo[0].id, [1.0, -1.0])]).unwrap();
        assert_eq!(store.todo_embeddings(e.id, r.id).unwrap().len(), 1);

        let reduced = store.todo_reduced(r.id, c.id).unwrap();
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].unit, ids[0]);
        assert_eq!(reduced[0].position, [1.0, -1.0]);
    }

    #[test]
    fn test_duplicate_insert_rolls_back_whole_batch() {
        let store = create_test_store();
        let project = create_test_project(&store);
        let ids = add_texts(&store, project.id, &["a", "b"]);
        let model = store.ensure_model(project.id, Stage::Embedding, "e").unwrap();

        store.insert_embeddings(model.id, &[(ids[0], vec![1.0])]).unwrap();
        let result = store.insert_embeddings(model.id, &[(ids[1], vec![1.0]), (ids[0], vec![2.0])]);
        assert!(result.is_err());
        assert_eq!(store.count_derived(Stage::Embedding, model.id).unwrap(), 1);
    }

    #[test]
    fn test_delete_unit_cascades_derived_rows() {
        let store = create_test_store();
        let project = create_test_project(&store);
        let ids = add_texts(&store, project.id, &["a", "b"]);
        let e = store.ensure_model(project.id, Stage::Embedding, "e").unwrap();
        let r = store.ensure_model(project.id, Stage::Reduction, "r").unwrap();
        let c = store.ensure_model(project.id, Stage::Clustering, "c").unwrap();

        store
            .insert_embeddings(e.id, &[(ids[0], vec![1.0]), (ids[1], vec![2.0])])
            .unwrap();
        let emb = store.todo_embeddings(e.id, r.id).unwrap();
        store
            .insert_reduced(r.id, &[(emb[0].id, [0.0, 0.0]), (emb[1].id, [1.0, 1.0])])
            .unwrap();
        let red = store.todo_reduced(r.id, c.id).unwrap();
        store.insert_clusters(c.id, &[(red[0].id, 0), (red[1].id, 0)]).unwrap();

        assert!(store.delete_unit(ids[0]).unwrap());
        assert_eq!(store.count_derived(Stage::Embedding, e.id).unwrap(), 1);
        assert_eq!(store.count_derived(Stage::Reduction, r.id).unwrap(), 1);
        assert_eq!(store.count_derived(Stage::Clustering, c.id).unwrap(), 1);
    }

    #[test]
    fn test_delete_reduced_cascades_clusters() {
        let store = create_test_store();
        let project = create_test_project(&store);
        let ids = add_texts(&store, project.id, &["a"]);
        let e = store.ensure_model(project.id, Stage::Embedding, "e").unwrap();
        let r = store.ensure_model(project.id, Stage::Reduction, "r").unwrap();
        let c = store.ensure_model(project.id, Stage::Clustering, "c").unwrap();

        store.insert_embeddings(e.id, &[(ids[0], vec![1.0])]).unwrap();
        let emb = store.todo_embeddings(e.id, r.id).unwrap();
        store.insert_reduced(r.id, &[(emb[0].id, [0.0, 0.0])]).unwrap();
        let red = store.todo_reduced(r.id, c.id).unwrap();
        store.insert_clusters(c.id, &[(red[0].id, 3)]).unwrap();

        assert_eq!(store.delete_derived(Stage::Reduction, r.id).unwrap(), 1);
        assert_eq!(store.count_derived(Stage::Clustering, c.id).unwrap(), 0);
        // Embeddings are upstream and stay.
        assert_eq!(store.count_derived(Stage::Embedding, e.id).unwrap(), 1);
    }

    #[test]
    fn test_delete_model_cascades_its_rows_only() {
        let store = create_test_store();
        let project = create_test_project(&store);
        let ids = add_texts(&store, project.id, &["a"]);
        let old = store.ensure_model(project.id, Stage::Embedding, "old").unwrap();
        let new = store.ensure_model(project.id, Stage::Embedding, "new").unwrap();
        store.insert_embeddings(old.id, &[(ids[0], vec![1.0])]).unwrap();
        store.insert_embeddings(new.id, &[(ids[0], vec![2.0])]).unwrap();

        assert!(store.delete_model(old.id).unwrap());
        assert_eq!(store.count_derived(Stage::Embedding, old.id).unwrap(), 0);
        assert_eq!(store.count_derived(Stage::Embedding, new.id).unwrap(), 1);
    }

    #[test]
    fn test_plot_and_cluster_counts() {
        let store = create_test_store();
        let project = create_test_project(&store);
        let units = vec![
            NewUnit::new("a").with_label("x"),
            NewUnit::new("b").with_label("y"),
            NewUnit::new("c"),
        ];
        let ids = store.add_units(project.id, &units).unwrap();
        let e = store.ensure_model(project.id, Stage::Embedding, "e").unwrap();
        let r = store.ensure_model(project.id, Stage::Reduction, "r").unwrap();
        let c = store.ensure_model(project.id, Stage::Clustering, "c").unwrap();

        let rows: Vec<_> = ids.iter().map(|id| (*id, vec![0.0])).collect();
        store.insert_embeddings(e.id, &rows).unwrap();
        let emb = store.todo_embeddings(e.id, r.id).unwrap();
        let positions: Vec<_> = emb
            .iter()
            .enumerate()
            .map(|(i, row)| (row.id, [i as f32, 0.5]))
            .collect();
        store.insert_reduced(r.id, &positions).unwrap();
        let red = store.todo_reduced(r.id, c.id).unwrap();
        store.insert_clusters(c.id, &[(red[0].id, 0), (red[1].id, 0)]).unwrap();

        let plot = store.plot(r.id, Some(c.id)).unwrap();
        assert_eq!(plot.len(), 3);
        assert_eq!(plot[0].label.as_deref(), Some("x"));
        assert_eq!(plot[1].x, 1.0);
        assert_eq!(plot[0].cluster, Some(0));
        assert_eq!(plot[2].cluster, None);

        let without_clusters = store.plot(r.id, None).unwrap();
        assert!(without_clusters.iter().all(|row| row.cluster.is_none()));

        assert_eq!(store.cluster_counts(c.id).unwrap(), vec![(0, 2)]);
    }

    #[test]
    fn test_relabel_and_training_rows() {
        let store = create_test_store();
        let project = create_test_project(&store);
        let ids = add_texts(&store, project.id, &["a", "b"]);
        let e = store.ensure_model(project.id, Stage::Embedding, "e").unwrap();
        store.insert_embeddings(e.id, &[(ids[0], vec![1.0, 0.0])]).unwrap();

        assert!(store.relabel_unit(ids[0], Some("topic")).unwrap());
        let rows = store.training_rows(project.id, e.id).unwrap();
        // Only units with an embedding under the model take part.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label.as_deref(), Some("topic"));
        assert_eq!(rows[0].vector, vec![1.0, 0.0]);
    }

    #[test]
    fn test_delete_project_cascades_everything() {
        let store = create_test_store();
        let project = create_test_project(&store);
        let ids = add_texts(&store, project.id, &["a"]);
        let e = store.ensure_model(project.id, Stage::Embedding, "e").unwrap();
        store.insert_embeddings(e.id, &[(ids[0], vec![1.0])]).unwrap();

        assert!(store.delete_project(project.id).unwrap());
        assert_eq!(store.count_units(project.id).unwrap(), 0);
        assert!(store.list_models(project.id).unwrap().is_empty());
        assert_eq!(store.count_derived(Stage::Embedding, e.id).unwrap(), 0);
    }

    #[test]
    fn test_wal_mode_enabled_at_connection() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test-wal.db");
        let store = SqliteStore::open(&db_path).unwrap();

        let journal_mode: String = store
            .conn
            .lock()
            .unwrap()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();

        assert_eq!(journal_mode, "wal");
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("store.db");
        let project_id = {
            let store = SqliteStore::open(&db_path).unwrap();
            let project = create_test_project(&store);
            add_texts(&store, project.id, &["persisted"]);
            project.id
        };

        let store = SqliteStore::open(&db_path).unwrap();
        let units = store.list_units(project_id).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].text, "persisted");
    }
}
