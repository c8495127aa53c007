use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::error::StoreError;
use super::filter::FilterParams;
use super::process::FileStats;

const BUSY_TIMEOUT: Duration = Duration::from_secs(120);

const SCHEMA: &str = r#"
    PRAGMA journal_mode = WAL;

    CREATE TABLE IF NOT EXISTS filter_params (
        id TEXT NOT NULL PRIMARY KEY,
        date TEXT NOT NULL,
        notch1 REAL,
        notch2 REAL,
        width REAL NOT NULL,
        origin REAL,
        offset REAL NOT NULL
    );

    CREATE TABLE IF NOT EXISTS file_params (
        cruise TEXT NOT NULL,
        file TEXT NOT NULL,
        param_id TEXT NOT NULL,
        notch1 REAL,
        notch2 REAL,
        origin REAL,
        PRIMARY KEY (file, param_id)
    );

    CREATE TABLE IF NOT EXISTS opp_stats (
        cruise TEXT NOT NULL,
        file TEXT NOT NULL,
        param_id TEXT NOT NULL,
        band REAL NOT NULL,
        particle_count INTEGER NOT NULL,
        signal_count INTEGER NOT NULL,
        opp_count INTEGER NOT NULL,
        ratio REAL,
        PRIMARY KEY (file, param_id, band)
    );

    CREATE TABLE IF NOT EXISTS population_stats (
        cruise TEXT NOT NULL,
        file TEXT NOT NULL,
        scheme_id TEXT NOT NULL,
        population TEXT NOT NULL,
        count INTEGER NOT NULL,
        fsc_small_mean REAL,
        chl_small_mean REAL,
        pe_mean REAL,
        PRIMARY KEY (file, scheme_id, population)
    );

    CREATE INDEX IF NOT EXISTS opp_stats_file ON opp_stats (file);
    CREATE INDEX IF NOT EXISTS population_stats_file ON population_stats (file);
    CREATE INDEX IF NOT EXISTS file_params_file ON file_params (file);
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct OppRow {
    pub cruise: String,
    pub file: String,
    pub param_id: String,
    pub band: f64,
    pub particle_count: usize,
    pub signal_count: usize,
    pub opp_count: usize,
    pub ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PopulationRow {
    pub cruise: String,
    pub file: String,
    pub scheme_id: String,
    pub population: String,
    pub count: usize,
    pub fsc_small_mean: Option<f64>,
    pub chl_small_mean: Option<f64>,
    pub pe_mean: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileParamsRow {
    pub cruise: String,
    pub file: String,
    pub param_id: String,
    pub notch1: Option<f64>,
    pub notch2: Option<f64>,
    pub origin: Option<f64>,
}

/// SQLite store of filtering results. Every file is written in a single transaction which
/// replaces whatever a previous run stored for the same file and parameter id (or scheme id),
/// so rerunning a file never duplicates rows.
#[derive(Debug)]
pub struct ResultStore {
    conn: Connection,
    cruise: String,
}

impl ResultStore {
    /// Open (or create) the database at path
    pub fn open(path: &Path, cruise: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        spdlog::info!("Opened result database {}", path.display());
        Self::init(conn, cruise)
    }

    pub fn open_in_memory(cruise: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, cruise)
    }

    fn init(conn: Connection, cruise: &str) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            cruise: cruise.to_string(),
        })
    }

    /// Parameters registered under id, if any
    pub fn stored_params(&self, id: &str) -> Result<Option<FilterParams>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT notch1, notch2, width, origin, offset FROM filter_params WHERE id = ?1",
                params![id],
                |row| {
                    Ok(FilterParams {
                        notch1: row.get(0)?,
                        notch2: row.get(1)?,
                        width: row.get(2)?,
                        origin: row.get(3)?,
                        offset: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    /// Insert params under id. Registering the same id again keeps the first entry.
    pub fn register_params(&self, id: &str, params: &FilterParams) -> Result<(), StoreError> {
        let date = OffsetDateTime::now_utc().format(&Rfc3339)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO filter_params (id, date, notch1, notch2, width, origin, offset)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                date,
                params.notch1,
                params.notch2,
                params.width,
                params.origin,
                params.offset
            ],
        )?;
        Ok(())
    }

    /// Replace all rows of one file for param_id (and scheme_id when given) in one transaction.
    /// A file whose classification failed keeps its filter rows and loses its population rows.
    pub fn save_file(
        &mut self,
        param_id: &str,
        scheme_id: Option<&str>,
        stats: &FileStats,
    ) -> Result<(), StoreError> {
        let file = stats.file_id.as_str();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM file_params WHERE file = ?1 AND param_id = ?2",
            params![file, param_id],
        )?;
        tx.execute(
            "DELETE FROM opp_stats WHERE file = ?1 AND param_id = ?2",
            params![file, param_id],
        )?;

        tx.execute(
            "INSERT INTO file_params (cruise, file, param_id, notch1, notch2, origin)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.cruise,
                file,
                param_id,
                stats.params.notch1,
                stats.params.notch2,
                stats.params.origin
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO opp_stats
                 (cruise, file, param_id, band, particle_count, signal_count, opp_count, ratio)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for band in stats.bands.iter() {
                stmt.execute(params![
                    self.cruise,
                    file,
                    param_id,
                    band.band.quantile,
                    stats.particle_count as i64,
                    stats.signal_count as i64,
                    band.opp_count as i64,
                    band.ratio
                ])?;
            }
        }

        if let Some(scheme_id) = scheme_id {
            tx.execute(
                "DELETE FROM population_stats WHERE file = ?1 AND scheme_id = ?2",
                params![file, scheme_id],
            )?;
            if let Some(populations) = &stats.populations {
                let mut stmt = tx.prepare(
                    "INSERT INTO population_stats
                     (cruise, file, scheme_id, population, count, fsc_small_mean, chl_small_mean, pe_mean)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for pop in populations.iter() {
                    stmt.execute(params![
                        self.cruise,
                        file,
                        scheme_id,
                        pop.population,
                        pop.count as i64,
                        pop.fsc_small_mean,
                        pop.chl_small_mean,
                        pop.pe_mean
                    ])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Band rows of one file, ordered by band quantile
    pub fn opp_rows(&self, file: &str, param_id: &str) -> Result<Vec<OppRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT cruise, file, param_id, band, particle_count, signal_count, opp_count, ratio
             FROM opp_stats WHERE file = ?1 AND param_id = ?2 ORDER BY band",
        )?;
        let rows = stmt.query_map(params![file, param_id], |row| {
            Ok(OppRow {
                cruise: row.get(0)?,
                file: row.get(1)?,
                param_id: row.get(2)?,
                band: row.get(3)?,
                particle_count: row.get::<_, i64>(4)? as usize,
                signal_count: row.get::<_, i64>(5)? as usize,
                opp_count: row.get::<_, i64>(6)? as usize,
                ratio: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Population rows of one file in the order they were written
    pub fn population_rows(
        &self,
        file: &str,
        scheme_id: &str,
    ) -> Result<Vec<PopulationRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT cruise, file, scheme_id, population, count, fsc_small_mean, chl_small_mean, pe_mean
             FROM population_stats WHERE file = ?1 AND scheme_id = ?2 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![file, scheme_id], |row| {
            Ok(PopulationRow {
                cruise: row.get(0)?,
                file: row.get(1)?,
                scheme_id: row.get(2)?,
                population: row.get(3)?,
                count: row.get::<_, i64>(4)? as usize,
                fsc_small_mean: row.get(5)?,
                chl_small_mean: row.get(6)?,
                pe_mean: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn file_params_row(
        &self,
        file: &str,
        param_id: &str,
    ) -> Result<Option<FileParamsRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT cruise, file, param_id, notch1, notch2, origin
                 FROM file_params WHERE file = ?1 AND param_id = ?2",
                params![file, param_id],
                |row| {
                    Ok(FileParamsRow {
                        cruise: row.get(0)?,
                        file: row.get(1)?,
                        param_id: row.get(2)?,
                        notch1: row.get(3)?,
                        notch2: row.get(4)?,
                        origin: row.get(5)?,
                    })
                },
            )
            .optional()?)
    }

    /// Number of distinct files with stored results for param_id
    pub fn opp_file_count(&self, param_id: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT file) FROM opp_stats WHERE param_id = ?1",
            params![param_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Band, ResolvedParams};
    use crate::gating::PopulationCount;
    use crate::process::BandStats;
    use crate::evt_file::tests::test_id;

    fn stats(opp_counts: &[usize], populations: Option<Vec<PopulationCount>>) -> FileStats {
        let quantiles = [2.5, 50.0, 97.5];
        FileStats {
            file_id: test_id(),
            path: test_id().as_str().into(),
            particle_count: 100,
            signal_count: 90,
            saturated_count: 4,
            noise_count: 6,
            aligned_count: 50,
            params: ResolvedParams {
                notch1: Some(0.75),
                notch2: Some(0.8),
                origin: Some(-1200.0),
                width: 0.5,
                offset: 0.0,
            },
            estimate: None,
            bands: quantiles
                .iter()
                .zip(opp_counts.iter())
                .map(|(q, c)| BandStats {
                    band: Band::new(*q),
                    opp_count: *c,
                    ratio: Some(*c as f64 / 100.0),
                })
                .collect(),
            populations,
            classify_error: None,
        }
    }

    fn pop(name: &str, count: usize) -> PopulationCount {
        PopulationCount {
            population: name.to_string(),
            count,
            fsc_small_mean: Some(10.0),
            chl_small_mean: None,
            pe_mean: Some(3.0),
        }
    }

    #[test]
    fn test_register_params() {
        let store = ResultStore::open_in_memory("test").unwrap();
        assert!(store.stored_params("a").unwrap().is_none());
        let params = FilterParams {
            notch1: Some(0.5),
            ..Default::default()
        };
        store.register_params("a", &params).unwrap();
        store
            .register_params(
                "a",
                &FilterParams {
                    width: 2.0,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.stored_params("a").unwrap(), Some(params));
    }

    #[test]
    fn test_save_is_idempotent() {
        let mut store = ResultStore::open_in_memory("test").unwrap();
        let s = stats(&[30, 20, 10], Some(vec![pop("beads", 5), pop("unclassified", 15)]));
        store.save_file("p", Some("g"), &s).unwrap();
        store.save_file("p", Some("g"), &s).unwrap();
        let file = s.file_id.as_str();
        let rows = store.opp_rows(file, "p").unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].opp_count, 20);
        assert_eq!(rows[1].ratio, Some(0.2));
        assert_eq!(store.population_rows(file, "g").unwrap().len(), 2);
        assert_eq!(store.opp_file_count("p").unwrap(), 1);
    }

    #[test]
    fn test_save_replaces_previous_run() {
        let mut store = ResultStore::open_in_memory("test").unwrap();
        store
            .save_file("p", Some("g"), &stats(&[30, 20, 10], Some(vec![pop("beads", 5)])))
            .unwrap();
        let mut rerun = stats(&[31, 21, 11], None);
        rerun.params.notch1 = None;
        rerun.classify_error = Some("bad scheme".to_string());
        store.save_file("p", Some("g"), &rerun).unwrap();

        let file = rerun.file_id.as_str();
        let counts: Vec<usize> = store
            .opp_rows(file, "p")
            .unwrap()
            .iter()
            .map(|r| r.opp_count)
            .collect();
        assert_eq!(counts, vec![31, 21, 11]);
        assert!(store.population_rows(file, "g").unwrap().is_empty());
        let fp = store.file_params_row(file, "p").unwrap().unwrap();
        assert_eq!(fp.notch1, None);
        assert_eq!(fp.origin, Some(-1200.0));
    }

    #[test]
    fn test_param_ids_are_separate() {
        let mut store = ResultStore::open_in_memory("test").unwrap();
        let s = stats(&[3, 2, 1], None);
        store.save_file("p1", None, &s).unwrap();
        store.save_file("p2", None, &s).unwrap();
        assert_eq!(store.opp_file_count("p1").unwrap(), 1);
        assert_eq!(store.opp_rows(s.file_id.as_str(), "p2").unwrap().len(), 3);
    }

    #[test]
    fn test_reopen_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db").join("cruise.db");
        {
            let mut store = ResultStore::open(&path, "cruise").unwrap();
            store.save_file("p", None, &stats(&[3, 2, 1], None)).unwrap();
        }
        let store = ResultStore::open(&path, "cruise").unwrap();
        let rows = store.opp_rows(test_id().as_str(), "p").unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].cruise, "cruise");
    }

    #[test]
    fn test_failed_save_keeps_previous_rows() {
        let mut store = ResultStore::open_in_memory("test").unwrap();
        let saved = stats(&[30, 20, 10], Some(vec![pop("beads", 5)]));
        store.save_file("p", Some("g"), &saved).unwrap();

        // A repeated band violates the primary key after the old rows were deleted
        let mut broken = stats(&[7, 7, 7], None);
        broken.bands[1].band = broken.bands[0].band;
        assert!(matches!(
            store.save_file("p", Some("g"), &broken),
            Err(StoreError::SqliteError(_))
        ));

        let file = saved.file_id.as_str();
        let counts: Vec<usize> = store
            .opp_rows(file, "p")
            .unwrap()
            .iter()
            .map(|r| r.opp_count)
            .collect();
        assert_eq!(counts, vec![30, 20, 10]);
        assert_eq!(store.population_rows(file, "g").unwrap().len(), 1);
        assert_eq!(
            store.file_params_row(file, "p").unwrap().unwrap().notch1,
            Some(0.75)
        );
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cruise.db");
        let stores = vec![
            ResultStore::open(&path, "cruise").unwrap(),
            ResultStore::open(&path, "cruise").unwrap(),
        ];
        std::thread::scope(|s| {
            for (writer, mut store) in stores.into_iter().enumerate() {
                s.spawn(move || {
                    for i in 0..50 {
                        let opp = writer * 100 + i;
                        let saved = stats(&[opp, opp, opp], Some(vec![pop("beads", i)]));
                        store.save_file("p", Some("g"), &saved).unwrap();
                    }
                });
            }
        });

        let store = ResultStore::open(&path, "cruise").unwrap();
        let file = test_id();
        let rows = store.opp_rows(file.as_str(), "p").unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.opp_count == rows[0].opp_count));
        assert_eq!(store.population_rows(file.as_str(), "g").unwrap().len(), 1);
        assert_eq!(store.opp_file_count("p").unwrap(), 1);
    }
}
