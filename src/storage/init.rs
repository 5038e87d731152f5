use crate::storage::tables::{BACKUPS, DIRTY, ITEMS, LINKS, RECORDS, SCALARS};
use crate::{info, AppError};
use redb::Database;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs};

/// Owner of the backing database file. One `Storage` can serve any number of
/// `FieldCache` views; each view loads its own in-memory state from it.
pub struct Storage {
    db: Arc<Database>,
    pub path: PathBuf,
}

impl Storage {
    /// Create or open the database at `path` and make sure every table
    /// exists, so later read transactions never race table creation.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Storage>, AppError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let existed = path.exists();
        let db = Database::builder().create(&path)?;
        if existed {
            info!("Opening existing metadata db at {:?}", path);
        } else {
            info!("Creating metadata db at {:?}", path);
        }
        let storage = Storage { db: Arc::new(db), path };
        storage.ensure_tables()?;
        Ok(Arc::new(storage))
    }

    /// Fresh database under the system temp dir, suffixed randomly so
    /// parallel tests never collide.
    pub fn temp(name: &str) -> Result<Arc<Storage>, AppError> {
        let dir = env::temp_dir().join("folio");
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Self::open(dir.join(format!("{}_{}.redb", name, rand::random::<u64>())))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    fn ensure_tables(&self) -> Result<(), AppError> {
        let tx = self.db.begin_write()?;
        {
            tx.open_table(RECORDS)?;
            tx.open_table(SCALARS)?;
            tx.open_table(ITEMS)?;
            tx.open_table(LINKS)?;
            tx.open_table(DIRTY)?;
            tx.open_table(BACKUPS)?;
        }
        tx.commit()?;
        Ok(())
    }
}
