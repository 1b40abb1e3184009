use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::AppError;
use crate::models::bookmark::{
    BookmarkChanges, BookmarkEvent, BookmarkNode, CreateDetails, MoveDestination,
};

const ROOT_ID: &str = "0";
const EVENT_CAPACITY: usize = 256;

/// The browser-owned hierarchical bookmark store.
///
/// `get_tree` returns the top-level folders (bookmarks bar, other bookmarks,
/// ...), not the invisible root above them. The store can change between any
/// two calls; callers treat stale ids as per-operation failures.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    async fn get_tree(&self) -> Result<Vec<BookmarkNode>, AppError>;
    async fn get_children(&self, id: &str) -> Result<Vec<BookmarkNode>, AppError>;
    async fn get(&self, id: &str) -> Result<BookmarkNode, AppError>;
    async fn create(&self, details: CreateDetails) -> Result<BookmarkNode, AppError>;
    async fn move_node(&self, id: &str, destination: MoveDestination)
        -> Result<BookmarkNode, AppError>;
    async fn update(&self, id: &str, changes: BookmarkChanges) -> Result<BookmarkNode, AppError>;
    /// Removes a bookmark or an empty folder.
    async fn remove(&self, id: &str) -> Result<(), AppError>;
    async fn remove_tree(&self, id: &str) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
struct Entry {
    title: String,
    url: Option<String>,
    parent_id: Option<String>,
    children: Vec<String>,
    date_added: i64,
    date_group_modified: Option<i64>,
}

#[derive(Debug, Default)]
struct Arena {
    entries: HashMap<String, Entry>,
    next_id: u64,
}

fn not_found(id: &str) -> AppError {
    AppError::Store(format!("bookmark not found: {id}"))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Arena {
    fn entry(&self, id: &str) -> Result<&Entry, AppError> {
        self.entries.get(id).ok_or_else(|| not_found(id))
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut Entry, AppError> {
        self.entries.get_mut(id).ok_or_else(|| not_found(id))
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn index_in_parent(&self, id: &str) -> usize {
        self.entries
            .get(id)
            .and_then(|entry| entry.parent_id.as_ref())
            .and_then(|parent| self.entries.get(parent))
            .and_then(|parent| parent.children.iter().position(|child| child == id))
            .unwrap_or(0)
    }

    fn node(&self, id: &str) -> Result<BookmarkNode, AppError> {
        let entry = self.entry(id)?;
        let children = if entry.url.is_none() {
            Some(
                entry
                    .children
                    .iter()
                    .map(|child| self.node(child))
                    .collect::<Result<Vec<_>, _>>()?,
            )
        } else {
            None
        };
        Ok(BookmarkNode {
            id: id.to_string(),
            title: entry.title.clone(),
            url: entry.url.clone(),
            parent_id: entry.parent_id.clone(),
            index: self.index_in_parent(id),
            date_added: entry.date_added,
            date_group_modified: entry.date_group_modified,
            children,
        })
    }

    fn is_protected(&self, id: &str) -> bool {
        id == ROOT_ID
            || self
                .entries
                .get(id)
                .is_some_and(|entry| entry.parent_id.as_deref() == Some(ROOT_ID))
    }

    fn is_descendant_of(&self, id: &str, ancestor: &str) -> bool {
        let mut current = Some(id.to_string());
        while let Some(cursor) = current {
            if cursor == ancestor {
                return true;
            }
            current = self.entries.get(&cursor).and_then(|e| e.parent_id.clone());
        }
        false
    }

    fn insert_node(&mut self, node: BookmarkNode, parent_id: &str) {
        let id = node.id.clone();
        if let Ok(numeric) = id.parse::<u64>() {
            self.next_id = self.next_id.max(numeric);
        }
        let child_ids = node
            .children
            .as_ref()
            .map(|children| children.iter().map(|c| c.id.clone()).collect())
            .unwrap_or_default();
        self.entries.insert(
            id.clone(),
            Entry {
                title: node.title,
                url: node.url,
                parent_id: Some(parent_id.to_string()),
                children: child_ids,
                date_added: node.date_added,
                date_group_modified: node.date_group_modified,
            },
        );
        for child in node.children.unwrap_or_default() {
            self.insert_node(child, &id);
        }
    }

    fn detach(&mut self, id: &str) -> Result<(String, usize), AppError> {
        let parent_id = self
            .entry(id)?
            .parent_id
            .clone()
            .ok_or_else(|| AppError::Store(format!("bookmark {id} has no parent")))?;
        let parent = self.entry_mut(&parent_id)?;
        let index = parent
            .children
            .iter()
            .position(|child| child == id)
            .unwrap_or(parent.children.len());
        parent.children.retain(|child| child != id);
        parent.date_group_modified = Some(now_millis());
        Ok((parent_id, index))
    }

    fn drop_subtree(&mut self, id: &str) {
        if let Some(entry) = self.entries.remove(id) {
            for child in entry.children {
                self.drop_subtree(&child);
            }
        }
    }
}

/// In-process [`BookmarkStore`] with the same shape as a Chromium profile:
/// an invisible root holding "Bookmarks bar" (`1`) and "Other bookmarks" (`2`).
/// Every mutation publishes a [`BookmarkEvent`].
pub struct MemoryBookmarkStore {
    arena: Mutex<Arena>,
    events: broadcast::Sender<BookmarkEvent>,
}

impl Default for MemoryBookmarkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBookmarkStore {
    pub fn new() -> Self {
        Self::from_forest(vec![
            BookmarkNode::folder("1", "Bookmarks bar", Vec::new()),
            BookmarkNode::folder("2", "Other bookmarks", Vec::new()),
        ])
    }

    /// Seeds the store with the given top-level folders, keeping their ids.
    /// Freshly created nodes get numeric ids above the largest seeded one.
    pub fn from_forest(forest: Vec<BookmarkNode>) -> Self {
        let mut arena = Arena::default();
        arena.entries.insert(
            ROOT_ID.to_string(),
            Entry {
                title: String::new(),
                url: None,
                parent_id: None,
                children: forest.iter().map(|node| node.id.clone()).collect(),
                date_added: 0,
                date_group_modified: None,
            },
        );
        for node in forest {
            arena.insert_node(node, ROOT_ID);
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            arena: Mutex::new(arena),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookmarkEvent> {
        self.events.subscribe()
    }

    fn with_arena<T>(&self, f: impl FnOnce(&mut Arena) -> Result<T, AppError>) -> Result<T, AppError> {
        let mut arena = self
            .arena
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut arena)
    }

    fn emit(&self, event: BookmarkEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl BookmarkStore for MemoryBookmarkStore {
    async fn get_tree(&self) -> Result<Vec<BookmarkNode>, AppError> {
        self.get_children(ROOT_ID).await
    }

    async fn get_children(&self, id: &str) -> Result<Vec<BookmarkNode>, AppError> {
        self.with_arena(|arena| {
            arena
                .entry(id)?
                .children
                .clone()
                .iter()
                .map(|child| arena.node(child))
                .collect()
        })
    }

    async fn get(&self, id: &str) -> Result<BookmarkNode, AppError> {
        self.with_arena(|arena| arena.node(id))
    }

    async fn create(&self, details: CreateDetails) -> Result<BookmarkNode, AppError> {
        let node = self.with_arena(|arena| {
            let parent = arena.entry(&details.parent_id)?;
            if parent.url.is_some() {
                return Err(AppError::Store(format!(
                    "parent {} is not a folder",
                    details.parent_id
                )));
            }
            if details.parent_id == ROOT_ID {
                return Err(AppError::Store("cannot create nodes under the root".to_string()));
            }

            let id = arena.allocate_id();
            let now = now_millis();
            arena.entries.insert(
                id.clone(),
                Entry {
                    title: details.title.clone(),
                    url: details.url.clone(),
                    parent_id: Some(details.parent_id.clone()),
                    children: Vec::new(),
                    date_added: now,
                    date_group_modified: details.url.is_none().then_some(now),
                },
            );
            let parent = arena.entry_mut(&details.parent_id)?;
            let index = details
                .index
                .unwrap_or(parent.children.len())
                .min(parent.children.len());
            parent.children.insert(index, id.clone());
            parent.date_group_modified = Some(now);

            arena.node(&id)
        })?;

        self.emit(BookmarkEvent::Created {
            id: node.id.clone(),
            node: node.clone(),
        });
        Ok(node)
    }

    async fn move_node(
        &self,
        id: &str,
        destination: MoveDestination,
    ) -> Result<BookmarkNode, AppError> {
        let (node, old_parent_id, old_index) = self.with_arena(|arena| {
            if arena.is_protected(id) {
                return Err(AppError::Store(format!("cannot move root folder {id}")));
            }
            arena.entry(id)?;
            let target = arena.entry(&destination.parent_id)?;
            if target.url.is_some() {
                return Err(AppError::Store(format!(
                    "destination {} is not a folder",
                    destination.parent_id
                )));
            }
            if destination.parent_id == ROOT_ID {
                return Err(AppError::Store("cannot move nodes under the root".to_string()));
            }
            if arena.is_descendant_of(&destination.parent_id, id) {
                return Err(AppError::Store(format!(
                    "cannot move {id} into its own subtree"
                )));
            }

            let (old_parent_id, old_index) = arena.detach(id)?;
            let target = arena.entry_mut(&destination.parent_id)?;
            let index = destination
                .index
                .unwrap_or(target.children.len())
                .min(target.children.len());
            target.children.insert(index, id.to_string());
            target.date_group_modified = Some(now_millis());
            arena.entry_mut(id)?.parent_id = Some(destination.parent_id.clone());

            Ok((arena.node(id)?, old_parent_id, old_index))
        })?;

        self.emit(BookmarkEvent::Moved {
            id: id.to_string(),
            parent_id: destination.parent_id,
            old_parent_id,
            index: node.index,
            old_index,
        });
        Ok(node)
    }

    async fn update(&self, id: &str, changes: BookmarkChanges) -> Result<BookmarkNode, AppError> {
        let node = self.with_arena(|arena| {
            if id == ROOT_ID {
                return Err(AppError::Store("cannot modify the root".to_string()));
            }
            let entry = arena.entry_mut(id)?;
            if changes.url.is_some() && entry.url.is_none() {
                return Err(AppError::Store(format!("cannot set a url on folder {id}")));
            }
            if let Some(title) = changes.title {
                entry.title = title;
            }
            if let Some(url) = changes.url {
                entry.url = Some(url);
            }
            arena.node(id)
        })?;

        self.emit(BookmarkEvent::Changed {
            id: node.id.clone(),
            title: node.title.clone(),
            url: node.url.clone(),
        });
        Ok(node)
    }

    async fn remove(&self, id: &str) -> Result<(), AppError> {
        let has_children = self.with_arena(|arena| Ok(!arena.entry(id)?.children.is_empty()))?;
        if has_children {
            return Err(AppError::Store(format!("folder {id} is not empty")));
        }
        self.remove_tree(id).await
    }

    async fn remove_tree(&self, id: &str) -> Result<(), AppError> {
        let (node, parent_id) = self.with_arena(|arena| {
            if arena.is_protected(id) {
                return Err(AppError::Store(format!("cannot remove root folder {id}")));
            }
            let node = arena.node(id)?;
            let (parent_id, _) = arena.detach(id)?;
            arena.drop_subtree(id);
            Ok((node, parent_id))
        })?;

        self.emit(BookmarkEvent::Removed {
            id: id.to_string(),
            parent_id,
            node,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryBookmarkStore {
        MemoryBookmarkStore::from_forest(vec![
            BookmarkNode::folder(
                "1",
                "Bookmarks bar",
                vec![
                    BookmarkNode::bookmark("10", "Rust", "https://rust-lang.org"),
                    BookmarkNode::folder(
                        "11",
                        "Dev",
                        vec![BookmarkNode::bookmark("12", "Tokio", "https://tokio.rs")],
                    ),
                ],
            ),
            BookmarkNode::folder("2", "Other bookmarks", Vec::new()),
        ])
    }

    #[tokio::test]
    async fn tree_reflects_seed_with_indices_and_parents() {
        let store = seeded();
        let tree = store.get_tree().await.unwrap();

        assert_eq!(tree.len(), 2);
        let bar_children = tree[0].children.as_ref().unwrap();
        assert_eq!(bar_children[1].id, "11");
        assert_eq!(bar_children[1].index, 1);
        assert_eq!(bar_children[1].parent_id.as_deref(), Some("1"));
        assert_eq!(store.get_children("11").await.unwrap()[0].title, "Tokio");
    }

    #[tokio::test]
    async fn create_allocates_fresh_ids_and_emits() {
        let store = seeded();
        let mut events = store.subscribe();

        let folder = store
            .create(CreateDetails {
                parent_id: "2".to_string(),
                title: "Reading".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(folder.id, "13");
        assert_eq!(folder.children, Some(Vec::new()));

        match events.recv().await.unwrap() {
            BookmarkEvent::Created { id, node } => {
                assert_eq!(id, "13");
                assert_eq!(node.title, "Reading");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn move_reports_old_and_new_position() {
        let store = seeded();
        let mut events = store.subscribe();

        let moved = store
            .move_node(
                "10",
                MoveDestination {
                    parent_id: "11".to_string(),
                    index: Some(0),
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.parent_id.as_deref(), Some("11"));
        assert_eq!(moved.index, 0);

        assert_eq!(
            events.recv().await.unwrap(),
            BookmarkEvent::Moved {
                id: "10".to_string(),
                parent_id: "11".to_string(),
                old_parent_id: "1".to_string(),
                index: 0,
                old_index: 0,
            }
        );
    }

    #[tokio::test]
    async fn invalid_moves_are_rejected() {
        let store = seeded();
        let into_self = MoveDestination {
            parent_id: "11".to_string(),
            index: None,
        };
        assert!(store.move_node("11", into_self).await.is_err());

        let root = MoveDestination {
            parent_id: "2".to_string(),
            index: None,
        };
        assert!(store.move_node("1", root).await.is_err());

        let missing = MoveDestination {
            parent_id: "404".to_string(),
            index: None,
        };
        assert!(matches!(
            store.move_node("10", missing).await,
            Err(AppError::Store(_))
        ));
    }

    #[tokio::test]
    async fn update_rejects_url_on_folder() {
        let store = seeded();
        let changes = BookmarkChanges {
            title: None,
            url: Some("https://x".to_string()),
        };
        assert!(store.update("11", changes).await.is_err());

        let renamed = store
            .update(
                "10",
                BookmarkChanges {
                    title: Some("Rust Lang".to_string()),
                    url: Some("https://www.rust-lang.org".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.url.as_deref(), Some("https://www.rust-lang.org"));
    }

    #[tokio::test]
    async fn remove_requires_empty_folder_but_remove_tree_does_not() {
        let store = seeded();
        let mut events = store.subscribe();

        assert!(store.remove("11").await.is_err());
        store.remove_tree("11").await.unwrap();
        assert!(store.get("12").await.is_err());

        match events.recv().await.unwrap() {
            BookmarkEvent::Removed { id, parent_id, node } => {
                assert_eq!(id, "11");
                assert_eq!(parent_id, "1");
                assert_eq!(node.children.unwrap().len(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }

        store.remove("10").await.unwrap();
        assert!(store.get_children("1").await.unwrap().is_empty());
        assert!(store.remove_tree("2").await.is_err());
    }
}
