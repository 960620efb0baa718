use std::fs;
use std::path::Path;

use rusqlite::{params, Connection, TransactionBehavior};
use tracing::debug;

use super::local::{Journal, JournalBatch, Snapshot};
use super::{Relationship, RelationshipKind};
use crate::contact::{Contact, ContactId};
use crate::error::{StoreError, StoreResult};

/// SQLite persistence for a [`super::LocalStore`]. Contacts are stored as
/// JSON documents keyed by id.
pub struct SqliteJournal {
    conn: Connection,
}

impl SqliteJournal {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let mut journal = Self { conn };
        journal.setup()?;
        debug!(path = %path.display(), "opened contact database");
        Ok(journal)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let mut journal = Self {
            conn: Connection::open_in_memory()?,
        };
        journal.setup()?;
        Ok(journal)
    }

    fn setup(&mut self) -> StoreResult<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "FULL")?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
              id          INTEGER PRIMARY KEY,
              sync_target TEXT,
              data        TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS relationships (
              kind   TEXT NOT NULL,
              first  INTEGER NOT NULL,
              second INTEGER NOT NULL,
              PRIMARY KEY (kind, first, second)
            );

            CREATE INDEX IF NOT EXISTS idx_relationships_second ON relationships(second);
        "#,
        )?;
        Ok(())
    }
}

fn kind_to_str(kind: RelationshipKind) -> &'static str {
    match kind {
        RelationshipKind::Aggregates => "aggregates",
        RelationshipKind::IsNot => "is_not",
    }
}

fn kind_from_str(s: &str) -> StoreResult<RelationshipKind> {
    match s {
        "aggregates" => Ok(RelationshipKind::Aggregates),
        "is_not" => Ok(RelationshipKind::IsNot),
        other => Err(StoreError::Backend(format!(
            "unknown relationship kind `{other}` in database"
        ))),
    }
}

impl Journal for SqliteJournal {
    fn load(&mut self) -> StoreResult<Snapshot> {
        let mut stmt = self.conn.prepare("SELECT data FROM contacts ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut contacts = Vec::new();
        for row in rows {
            let contact: Contact = serde_json::from_str(&row?)?;
            contacts.push(contact);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT kind, first, second FROM relationships ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, ContactId>(1)?,
                row.get::<_, ContactId>(2)?,
            ))
        })?;
        let mut relationships = Vec::new();
        for row in rows {
            let (kind, first, second) = row?;
            relationships.push(Relationship {
                kind: kind_from_str(&kind)?,
                first,
                second,
            });
        }

        Ok(Snapshot {
            contacts,
            relationships,
        })
    }

    fn persist(&mut self, batch: &JournalBatch<'_>) -> StoreResult<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        {
            let mut upsert = tx.prepare(
                r#"INSERT INTO contacts (id, sync_target, data) VALUES (?1, ?2, ?3)
                   ON CONFLICT(id) DO UPDATE SET
                     sync_target=excluded.sync_target,
                     data=excluded.data"#,
            )?;
            for contact in &batch.written {
                let data = serde_json::to_string(contact)?;
                upsert.execute(params![
                    contact.id,
                    contact.sync_target.as_ref().map(|target| target.as_str()),
                    data,
                ])?;
            }

            let mut delete = tx.prepare("DELETE FROM contacts WHERE id = ?1")?;
            for id in batch.removed {
                delete.execute(params![id])?;
            }

            let mut link = tx.prepare(
                "INSERT OR IGNORE INTO relationships (kind, first, second) VALUES (?1, ?2, ?3)",
            )?;
            for rel in batch.linked {
                link.execute(params![kind_to_str(rel.kind), rel.first, rel.second])?;
            }

            let mut unlink = tx.prepare(
                "DELETE FROM relationships WHERE kind = ?1 AND first = ?2 AND second = ?3",
            )?;
            for rel in batch.unlinked {
                unlink.execute(params![kind_to_str(rel.kind), rel.first, rel.second])?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::SyncTarget;
    use crate::store::local::{LocalStore, LocalStoreOptions};
    use tempfile::TempDir;

    #[test]
    fn test_persist_and_load_round_trip() {
        let mut journal = SqliteJournal::open_in_memory().unwrap();
        let mut contact = Contact::new("Alfred", "Alfredson");
        contact.id = 2;
        contact.sync_target = Some(SyncTarget::Local);
        let rel = Relationship::aggregates(3, 2);

        journal
            .persist(&JournalBatch {
                written: vec![&contact],
                linked: &[rel],
                ..Default::default()
            })
            .unwrap();

        let snapshot = journal.load().unwrap();
        assert_eq!(snapshot.contacts, vec![contact]);
        assert_eq!(snapshot.relationships, vec![rel]);

        journal
            .persist(&JournalBatch {
                removed: &[2],
                unlinked: &[rel],
                ..Default::default()
            })
            .unwrap();
        let snapshot = journal.load().unwrap();
        assert!(snapshot.contacts.is_empty());
        assert!(snapshot.relationships.is_empty());
    }

    #[tokio::test]
    async fn test_local_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("contacts.db");

        let aggregate = {
            let store =
                LocalStore::open(SqliteJournal::open(&path).unwrap(), LocalStoreOptions::default())
                    .unwrap();
            store.save_now(vec![Contact::new("Berta", "Bertason")]).unwrap()[0]
        };

        let store =
            LocalStore::open(SqliteJournal::open(&path).unwrap(), LocalStoreOptions::default())
                .unwrap();
        let contact = store.contact(aggregate).unwrap();
        assert_eq!(contact.name.first, "Berta");
        assert_eq!(store.constituents_of(aggregate).len(), 1);

        let next = store.save_now(vec![Contact::new("Carlo", "Carloson")]).unwrap()[0];
        assert!(next > aggregate);
    }
}
