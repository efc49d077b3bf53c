//! File identity resolution.
//!
//! Decides, for each incoming [`FileEvent`], whether it is a brand-new
//! document, an in-place modification, a rename of known content, a
//! restoration of a tombstoned document, or a deletion. Content hash has
//! priority over inode so a rename racing a delete for the same inode
//! resolves by content, never by coincidence of numbers.

use chrono::Utc;
use std::sync::Arc;

use crate::error::Result;
use crate::hash::content_hash;
use crate::models::{Document, FileEvent, FileEventKind, ResolvedAction, ResolvedEvent};
use crate::store::Store;

pub struct IdentityTracker {
    store: Arc<Store>,
}

impl IdentityTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Resolve an event against the document registry.
    ///
    /// Resolution priority for non-delete events:
    /// 1. live document with the same content hash → rename/move (or
    ///    nothing, if the path is unchanged);
    /// 2. tombstoned document with the same hash → restore;
    /// 3. live document at the same inode or path with a different hash
    ///    → in-place modification;
    /// 4. otherwise → new document.
    ///
    /// Returns `None` when the event needs no work (already indexed, or
    /// a delete for an unknown path).
    pub async fn resolve(&self, event: &FileEvent) -> Result<Option<ResolvedEvent>> {
        if event.kind == FileEventKind::Deleted {
            return self.resolve_delete(event).await;
        }

        let hash = content_hash(&event.path)?;
        let path_str = event.path.to_string_lossy().into_owned();
        let filename = event
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        // 1. Same live content: a move, or nothing at all.
        if let Some(mut doc) = self.store.find_live_by_hash(&hash).await? {
            if doc.path == path_str {
                tracing::debug!(path = %path_str, "already indexed, unchanged");
                return Ok(None);
            }
            doc.path = path_str;
            doc.filename = filename;
            doc.inode = event.stat.inode as i64;
            doc.modified_at = event.stat.modified_at.unwrap_or(doc.modified_at);
            return Ok(Some(ResolvedEvent {
                document: doc,
                action: ResolvedAction::Rename,
            }));
        }

        // 2. The content was deleted once; bring the identity back.
        if let Some(mut doc) = self.store.find_tombstoned_by_hash(&hash).await? {
            doc.path = path_str;
            doc.filename = filename;
            doc.inode = event.stat.inode as i64;
            doc.size = event.stat.size as i64;
            doc.media_type = event.media_type;
            doc.modified_at = event.stat.modified_at.unwrap_or(doc.modified_at);
            doc.is_deleted = false;
            doc.deleted_at = None;
            return Ok(Some(ResolvedEvent {
                document: doc,
                action: ResolvedAction::Restore,
            }));
        }

        // 3. Known file slot (inode, or path for editors that replace the
        //    inode on save), new content: in-place modification.
        let existing = match self.store.find_live_by_inode(event.stat.inode as i64).await? {
            Some(doc) => Some(doc),
            None => self.store.find_live_by_path(&path_str).await?,
        };
        if let Some(mut doc) = existing {
            doc.content_hash = hash;
            doc.path = path_str;
            doc.filename = filename;
            doc.inode = event.stat.inode as i64;
            doc.size = event.stat.size as i64;
            doc.media_type = event.media_type;
            doc.modified_at = event.stat.modified_at.unwrap_or_else(Utc::now);
            return Ok(Some(ResolvedEvent {
                document: doc,
                action: ResolvedAction::Update,
            }));
        }

        // 4. Never seen before.
        let doc = Document::new(&event.path, hash, event.media_type, &event.stat);
        Ok(Some(ResolvedEvent {
            document: doc,
            action: ResolvedAction::Insert,
        }))
    }

    async fn resolve_delete(&self, event: &FileEvent) -> Result<Option<ResolvedEvent>> {
        let path_str = event.path.to_string_lossy().into_owned();

        let doc = match self.store.find_live_by_inode(event.stat.inode as i64).await? {
            Some(doc) => Some(doc),
            None => self.store.find_live_by_path(&path_str).await?,
        };

        Ok(doc.map(|doc| ResolvedEvent {
            document: doc,
            action: ResolvedAction::Tombstone,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileStat, MediaType};
    use crate::watcher::stat_file;
    use std::path::Path;

    async fn setup() -> (tempfile::TempDir, Arc<Store>, IdentityTracker) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(
            Store::open_at(&tmp.path().join("docs.db"), &tmp.path().join("vectors"))
                .await
                .unwrap(),
        );
        let tracker = IdentityTracker::new(Arc::clone(&store));
        (tmp, store, tracker)
    }

    fn event_for(path: &Path, kind: FileEventKind) -> FileEvent {
        let stat = stat_file(path).unwrap_or_default();
        FileEvent {
            kind,
            path: path.to_path_buf(),
            prev_path: None,
            stat,
            media_type: MediaType::Document,
        }
    }

    fn delete_event(path: &Path) -> FileEvent {
        FileEvent {
            kind: FileEventKind::Deleted,
            path: path.to_path_buf(),
            prev_path: None,
            stat: FileStat::default(),
            media_type: MediaType::Document,
        }
    }

    #[tokio::test]
    async fn first_sighting_is_insert() {
        let (tmp, _store, tracker) = setup().await;
        let file = tmp.path().join("a.md");
        std::fs::write(&file, "alpha content".repeat(100)).unwrap();

        let resolved = tracker
            .resolve(&event_for(&file, FileEventKind::Created))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.action, ResolvedAction::Insert);
        assert_eq!(resolved.document.path, file.to_string_lossy());
    }

    #[tokio::test]
    async fn unchanged_file_resolves_to_nothing() {
        let (tmp, store, tracker) = setup().await;
        let file = tmp.path().join("a.md");
        std::fs::write(&file, "alpha content".repeat(100)).unwrap();

        let resolved = tracker
            .resolve(&event_for(&file, FileEventKind::Created))
            .await
            .unwrap()
            .unwrap();
        store.insert_document(&resolved.document).await.unwrap();

        let again = tracker
            .resolve(&event_for(&file, FileEventKind::Modified))
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn move_with_same_content_is_rename() {
        let (tmp, store, tracker) = setup().await;
        let old = tmp.path().join("x").join("foo.md");
        std::fs::create_dir_all(old.parent().unwrap()).unwrap();
        std::fs::write(&old, "stable content".repeat(100)).unwrap();

        let inserted = tracker
            .resolve(&event_for(&old, FileEventKind::Created))
            .await
            .unwrap()
            .unwrap();
        let original_id = inserted.document.id;
        store.insert_document(&inserted.document).await.unwrap();

        let new = tmp.path().join("y").join("foo.md");
        std::fs::create_dir_all(new.parent().unwrap()).unwrap();
        std::fs::rename(&old, &new).unwrap();

        let resolved = tracker
            .resolve(&event_for(&new, FileEventKind::Moved))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.action, ResolvedAction::Rename);
        assert_eq!(resolved.document.id, original_id);
        assert_eq!(resolved.document.path, new.to_string_lossy());
    }

    #[tokio::test]
    async fn changed_content_at_same_path_is_update() {
        let (tmp, store, tracker) = setup().await;
        let file = tmp.path().join("a.md");
        std::fs::write(&file, "A".repeat(2048)).unwrap();

        let inserted = tracker
            .resolve(&event_for(&file, FileEventKind::Created))
            .await
            .unwrap()
            .unwrap();
        let original_id = inserted.document.id;
        store.insert_document(&inserted.document).await.unwrap();

        std::fs::write(&file, "B".repeat(4096)).unwrap();
        let resolved = tracker
            .resolve(&event_for(&file, FileEventKind::Modified))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.action, ResolvedAction::Update);
        assert_eq!(resolved.document.id, original_id);
        assert_eq!(resolved.document.size, 4096);
        assert_ne!(resolved.document.content_hash, inserted.document.content_hash);
    }

    #[tokio::test]
    async fn reappearing_tombstoned_hash_is_restore() {
        let (tmp, store, tracker) = setup().await;
        let file = tmp.path().join("a.md");
        std::fs::write(&file, "phoenix content".repeat(100)).unwrap();

        let inserted = tracker
            .resolve(&event_for(&file, FileEventKind::Created))
            .await
            .unwrap()
            .unwrap();
        let original_id = inserted.document.id;
        store.insert_document(&inserted.document).await.unwrap();
        store.tombstone_document(original_id, None).await.unwrap();

        let resolved = tracker
            .resolve(&event_for(&file, FileEventKind::Created))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.action, ResolvedAction::Restore);
        assert_eq!(resolved.document.id, original_id);
        assert!(!resolved.document.is_deleted);
    }

    #[tokio::test]
    async fn delete_resolves_to_tombstone_or_nothing() {
        let (tmp, store, tracker) = setup().await;
        let file = tmp.path().join("a.md");
        std::fs::write(&file, "going away".repeat(200)).unwrap();

        let inserted = tracker
            .resolve(&event_for(&file, FileEventKind::Created))
            .await
            .unwrap()
            .unwrap();
        store.insert_document(&inserted.document).await.unwrap();

        std::fs::remove_file(&file).unwrap();
        let resolved = tracker.resolve(&delete_event(&file)).await.unwrap().unwrap();
        assert_eq!(resolved.action, ResolvedAction::Tombstone);
        assert_eq!(resolved.document.id, inserted.document.id);

        // Deleting something never indexed is a no-op.
        let unknown = tracker
            .resolve(&delete_event(Path::new("/nowhere/else.md")))
            .await
            .unwrap();
        assert!(unknown.is_none());
    }
}
