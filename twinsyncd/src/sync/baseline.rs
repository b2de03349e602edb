use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use twinsync_core::{DataElement, ElementPath, ElementType, PathError};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("properties encoding error: {0}")]
    Properties(#[from] serde_json::Error),
    #[error("stored path is invalid: {0}")]
    Path(#[from] PathError),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid element type: {0}")]
    InvalidElementType(String),
    #[error("element size {0} does not fit the baseline column")]
    SizeOverflow(u64),
}

/// Last synchronized state per (domain, path). Each side owns one domain.
#[derive(Clone)]
pub struct BaselineStore {
    pool: SqlitePool,
}

impl BaselineStore {
    /// Private in-memory database on a single connection.
    pub async fn in_memory() -> Result<Self, BaselineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: PathBuf) -> Result<Self, BaselineError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), BaselineError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get_element(
        &self,
        domain: &str,
        path: &ElementPath,
    ) -> Result<Option<DataElement>, BaselineError> {
        let row = sqlx::query(
            "SELECT path, element_type, size, modified, properties FROM baseline WHERE domain = ?1 AND path = ?2",
        )
        .bind(domain)
        .bind(path.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| element_from_row(&row)).transpose()
    }

    pub async fn store_element(
        &self,
        domain: &str,
        path: &ElementPath,
        element: &DataElement,
    ) -> Result<(), BaselineError> {
        let properties = element
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let size = stored_size(element.size)?;
        sqlx::query(
            "INSERT INTO baseline (domain, path, parent_path, element_type, size, modified, properties)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(domain, path) DO UPDATE SET
                parent_path = excluded.parent_path,
                element_type = excluded.element_type,
                size = excluded.size,
                modified = excluded.modified,
                properties = excluded.properties",
        )
        .bind(domain)
        .bind(path.to_string())
        .bind(path.parent().map(|parent| parent.to_string()))
        .bind(element.element_type.as_str())
        .bind(size)
        .bind(element.modified)
        .bind(properties)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes the entry for `path` together with everything below it.
    pub async fn delete_element(
        &self,
        domain: &str,
        path: &ElementPath,
    ) -> Result<(), BaselineError> {
        sqlx::query(
            "DELETE FROM baseline WHERE domain = ?1 AND (path = ?2 OR substr(path, 1, length(?3)) = ?3)",
        )
        .bind(domain)
        .bind(path.to_string())
        .bind(subtree_prefix(path))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes everything below `path`, keeping the entry itself.
    pub async fn purge_children(
        &self,
        domain: &str,
        path: &ElementPath,
    ) -> Result<u64, BaselineError> {
        let result =
            sqlx::query("DELETE FROM baseline WHERE domain = ?1 AND substr(path, 1, length(?2)) = ?2")
                .bind(domain)
                .bind(subtree_prefix(path))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_child_elements(
        &self,
        domain: &str,
        path: &ElementPath,
    ) -> Result<Vec<DataElement>, BaselineError> {
        let rows = sqlx::query(
            "SELECT path, element_type, size, modified, properties FROM baseline
             WHERE domain = ?1 AND parent_path = ?2
             ORDER BY path ASC",
        )
        .bind(domain)
        .bind(path.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(element_from_row).collect()
    }

    /// Moves an entry and its descendants to another (domain, path) in one transaction.
    pub async fn move_element(
        &self,
        src_domain: &str,
        src_path: &ElementPath,
        dest_domain: &str,
        dest_path: &ElementPath,
    ) -> Result<u64, BaselineError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT path, element_type, size, modified, properties FROM baseline
             WHERE domain = ?1 AND (path = ?2 OR substr(path, 1, length(?3)) = ?3)",
        )
        .bind(src_domain)
        .bind(src_path.to_string())
        .bind(subtree_prefix(src_path))
        .fetch_all(&mut *tx)
        .await?;

        let mut moved = 0;
        for row in &rows {
            let element = element_from_row(row)?;
            let Some(target) = element.path.rebase(src_path, dest_path) else {
                continue;
            };
            sqlx::query("DELETE FROM baseline WHERE domain = ?1 AND path = ?2")
                .bind(src_domain)
                .bind(element.path.to_string())
                .execute(&mut *tx)
                .await?;
            let properties = element
                .properties
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let size = stored_size(element.size)?;
            sqlx::query(
                "INSERT OR REPLACE INTO baseline (domain, path, parent_path, element_type, size, modified, properties)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(dest_domain)
            .bind(target.to_string())
            .bind(target.parent().map(|parent| parent.to_string()))
            .bind(element.element_type.as_str())
            .bind(size)
            .bind(element.modified)
            .bind(properties)
            .execute(&mut *tx)
            .await?;
            moved += 1;
        }
        tx.commit().await?;
        Ok(moved)
    }

    pub async fn count(&self, domain: &str) -> Result<i64, BaselineError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM baseline WHERE domain = ?1")
            .bind(domain)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn clear(&self) -> Result<(), BaselineError> {
        sqlx::query("DELETE FROM baseline")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub fn default_db_path() -> Result<PathBuf, BaselineError> {
    let base = dirs::data_dir().ok_or(BaselineError::MissingDataDir)?;
    Ok(base.join("twinsync").join("baseline.db"))
}

fn subtree_prefix(path: &ElementPath) -> String {
    if path.is_root() {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

fn stored_size(size: u64) -> Result<i64, BaselineError> {
    i64::try_from(size).map_err(|_| BaselineError::SizeOverflow(size))
}

fn element_from_row(row: &SqliteRow) -> Result<DataElement, BaselineError> {
    let path: String = row.try_get("path")?;
    let element_type: String = row.try_get("element_type")?;
    let size: i64 = row.try_get("size")?;
    let properties: Option<String> = row.try_get("properties")?;
    let properties = properties
        .map(|raw| serde_json::from_str::<BTreeMap<String, String>>(&raw))
        .transpose()?;
    Ok(DataElement {
        path: ElementPath::parse(&path)?,
        element_type: ElementType::parse(&element_type)
            .ok_or(BaselineError::InvalidElementType(element_type))?,
        size: size.max(0) as u64,
        modified: row.try_get("modified")?,
        properties,
    })
}

#[cfg(test)]
#[path = "baseline_tests.rs"]
mod tests;
