use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};

use crate::data::tag_store::TagStore;
use crate::error::AppError;
use crate::models::bookmark::{BookmarkNode, BookmarkTag, CreateDetails, MoveDestination};
use crate::models::operation::{ApplyReport, OperationKind};
use crate::models::organize::{BookmarkOrganization, GeneratedNode};
use crate::services::bookmark_store::BookmarkStore;
use crate::services::organize_service::{root_role, RootRole};

/// Applies one batch of per-bookmark patches.
///
/// An `Err` means the batch as a whole could not be applied; individual move
/// failures are reported inside the [`ApplyReport`] instead.
#[async_trait]
pub trait OrganizationApplier: Send + Sync {
    async fn apply_batch(&self, plan: &[BookmarkOrganization]) -> Result<ApplyReport, AppError>;
}

/// Tags go to the tag store in one transaction, then moves run one by one
/// against the bookmark store.
pub struct BatchPlanApplier {
    bookmarks: Arc<dyn BookmarkStore>,
    tags: Arc<dyn TagStore>,
}

impl BatchPlanApplier {
    pub fn new(bookmarks: Arc<dyn BookmarkStore>, tags: Arc<dyn TagStore>) -> Self {
        Self { bookmarks, tags }
    }
}

/// Moves `id` under `parent_id` unless it is already there.
async fn move_if_needed(
    store: &dyn BookmarkStore,
    id: &str,
    parent_id: &str,
    report: &mut ApplyReport,
) {
    let current = match store.get(id).await {
        Ok(node) => node,
        Err(e) => {
            tracing::warn!(bookmark_id = %id, error = %e, "bookmark not readable, skipping move");
            report.record_failure(OperationKind::Move, id, e);
            return;
        }
    };
    if current.parent_id.as_deref() == Some(parent_id) {
        report.moves_skipped += 1;
        return;
    }

    let destination = MoveDestination {
        parent_id: parent_id.to_string(),
        index: None,
    };
    match store.move_node(id, destination).await {
        Ok(_) => report.bookmarks_moved += 1,
        Err(e) => {
            tracing::warn!(bookmark_id = %id, parent_id = %parent_id, error = %e, "failed to move bookmark");
            report.record_failure(OperationKind::Move, id, e);
        }
    }
}

#[async_trait]
impl OrganizationApplier for BatchPlanApplier {
    async fn apply_batch(&self, plan: &[BookmarkOrganization]) -> Result<ApplyReport, AppError> {
        let mut report = ApplyReport::default();

        let tag_updates: Vec<BookmarkTag> = plan
            .iter()
            .filter(|item| item.has_tags())
            .filter_map(|item| match &item.url {
                Some(url) if !url.is_empty() => Some(BookmarkTag {
                    url: url.clone(),
                    tags: item.tags.clone().unwrap_or_default(),
                }),
                _ => {
                    tracing::warn!(bookmark_id = %item.bookmark_id, "dropping tag update without url");
                    None
                }
            })
            .collect();

        if !tag_updates.is_empty() {
            self.tags.batch_put(&tag_updates)?;
            report.tags_updated = tag_updates.len();
        }

        for item in plan {
            if let Some(parent_id) = &item.new_parent_id {
                move_if_needed(self.bookmarks.as_ref(), &item.bookmark_id, parent_id, &mut report)
                    .await;
            }
        }

        tracing::debug!(summary = %report.summary(), "applied organization batch");
        Ok(report)
    }
}

fn find_root<'a>(roots: &'a [BookmarkNode], title: &str) -> Option<&'a BookmarkNode> {
    match root_role(title) {
        Some(role) => roots
            .iter()
            .find(|root| root_role(&root.title) == Some(role))
            .or_else(|| match role {
                RootRole::BookmarksBar => roots.first(),
                RootRole::OtherBookmarks => roots.get(1),
            }),
        None => roots.iter().find(|root| root.title == title),
    }
}

async fn ensure_folder(
    store: &dyn BookmarkStore,
    parent_id: &str,
    title: &str,
    report: &mut ApplyReport,
) -> Result<String, AppError> {
    let existing = store.get_children(parent_id).await?;
    if let Some(folder) = existing
        .iter()
        .find(|node| node.url.is_none() && node.title == title)
    {
        report.folders_reused += 1;
        return Ok(folder.id.clone());
    }

    let created = store
        .create(CreateDetails {
            parent_id: parent_id.to_string(),
            title: title.to_string(),
            ..Default::default()
        })
        .await?;
    report.folders_created += 1;
    Ok(created.id)
}

fn apply_level<'a>(
    store: &'a dyn BookmarkStore,
    parent_id: &'a str,
    nodes: &'a [GeneratedNode],
    report: &'a mut ApplyReport,
) -> BoxFuture<'a, ()> {
    async move {
        for node in nodes {
            match node {
                GeneratedNode::Bookmark { id } => {
                    move_if_needed(store, id, parent_id, report).await;
                }
                GeneratedNode::Folder { title, children } => {
                    match ensure_folder(store, parent_id, title, report).await {
                        Ok(folder_id) => apply_level(store, &folder_id, children, report).await,
                        Err(e) => {
                            tracing::warn!(
                                folder = %title,
                                parent_id = %parent_id,
                                error = %e,
                                "failed to create folder, skipping its subtree"
                            );
                            report.record_failure(OperationKind::CreateFolder, title, e);
                        }
                    }
                }
            }
        }
    }
    .boxed()
}

/// Writes a reconciled generated tree into the store. Top-level nodes map to
/// the live roots by title; anything below is created or moved in order.
/// Best effort: failures are logged and counted, never rolled back.
pub async fn apply_generated_tree(
    store: &dyn BookmarkStore,
    forest_roots: &[BookmarkNode],
    tree: &[GeneratedNode],
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for node in tree {
        let GeneratedNode::Folder { title, children } = node else {
            tracing::warn!("generated top-level bookmark has no root folder, skipping");
            continue;
        };
        let Some(root) = find_root(forest_roots, title) else {
            tracing::warn!(folder = %title, "generated top-level folder is not a recognized root, skipping");
            continue;
        };
        tracing::debug!(folder = %title, root_id = %root.id, "applying generated root");
        apply_level(store, &root.id, children, &mut report).await;
    }

    tracing::info!(summary = %report.summary(), "applied generated bookmark tree");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tag_store::SqliteTagStore;
    use crate::models::bookmark::{BookmarkChanges, BookmarkEvent};
    use crate::services::bookmark_store::MemoryBookmarkStore;
    use tokio::sync::broadcast;

    fn seeded() -> MemoryBookmarkStore {
        MemoryBookmarkStore::from_forest(vec![
            BookmarkNode::folder(
                "1",
                "Bookmarks bar",
                vec![
                    BookmarkNode::bookmark("10", "Rust", "https://rust-lang.org"),
                    BookmarkNode::bookmark("11", "Tokio", "https://tokio.rs"),
                    BookmarkNode::folder("12", "Dev", vec![]),
                ],
            ),
            BookmarkNode::folder(
                "2",
                "Other bookmarks",
                vec![BookmarkNode::bookmark("20", "News", "https://news.example")],
            ),
        ])
    }

    /// Delegates to a memory store but refuses to create folders with a
    /// given title.
    struct RefusingStore {
        inner: MemoryBookmarkStore,
        refuse_title: &'static str,
    }

    #[async_trait]
    impl BookmarkStore for RefusingStore {
        async fn get_tree(&self) -> Result<Vec<BookmarkNode>, AppError> {
            self.inner.get_tree().await
        }
        async fn get_children(&self, id: &str) -> Result<Vec<BookmarkNode>, AppError> {
            self.inner.get_children(id).await
        }
        async fn get(&self, id: &str) -> Result<BookmarkNode, AppError> {
            self.inner.get(id).await
        }
        async fn create(&self, details: CreateDetails) -> Result<BookmarkNode, AppError> {
            if details.title == self.refuse_title {
                return Err(AppError::Store("quota exceeded".to_string()));
            }
            self.inner.create(details).await
        }
        async fn move_node(
            &self,
            id: &str,
            destination: MoveDestination,
        ) -> Result<BookmarkNode, AppError> {
            self.inner.move_node(id, destination).await
        }
        async fn update(&self, id: &str, changes: BookmarkChanges) -> Result<BookmarkNode, AppError> {
            self.inner.update(id, changes).await
        }
        async fn remove(&self, id: &str) -> Result<(), AppError> {
            self.inner.remove(id).await
        }
        async fn remove_tree(&self, id: &str) -> Result<(), AppError> {
            self.inner.remove_tree(id).await
        }
    }

    fn drain(events: &mut broadcast::Receiver<BookmarkEvent>) -> usize {
        let mut count = 0;
        while events.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn generated_tree_creates_folders_and_moves_bookmarks() {
        let store = seeded();
        let roots = store.get_tree().await.unwrap();
        let tree = vec![
            GeneratedNode::folder(
                "Bookmarks bar",
                vec![GeneratedNode::folder(
                    "Programming",
                    vec![GeneratedNode::bookmark("10"), GeneratedNode::bookmark("11")],
                )],
            ),
            GeneratedNode::folder("其他书签", vec![GeneratedNode::bookmark("20")]),
            GeneratedNode::folder("Mobile bookmarks", vec![GeneratedNode::bookmark("10")]),
        ];

        let report = apply_generated_tree(&store, &roots, &tree).await;

        assert_eq!(report.folders_created, 1);
        assert_eq!(report.bookmarks_moved, 2);
        assert_eq!(report.moves_skipped, 1);
        assert!(report.failures.is_empty());

        let moved = store.get("10").await.unwrap();
        let folder = store.get(moved.parent_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(folder.title, "Programming");
        assert_eq!(folder.parent_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn reapplying_the_same_tree_changes_nothing() {
        let store = seeded();
        let roots = store.get_tree().await.unwrap();
        let tree = vec![GeneratedNode::folder(
            "Bookmarks bar",
            vec![
                GeneratedNode::folder("Dev", vec![GeneratedNode::bookmark("10")]),
                GeneratedNode::bookmark("11"),
            ],
        )];
        apply_generated_tree(&store, &roots, &tree).await;
        let before = store.get_tree().await.unwrap();

        let mut events = store.subscribe();
        let report = apply_generated_tree(&store, &roots, &tree).await;

        assert!(report.failures.is_empty());
        assert_eq!(report.bookmarks_moved, 0);
        assert_eq!(report.folders_created, 0);
        assert_eq!(report.moves_skipped, 2);
        assert_eq!(drain(&mut events), 0);
        assert_eq!(store.get_tree().await.unwrap(), before);
    }

    #[tokio::test]
    async fn failed_folder_creation_skips_subtree_only() {
        let store = RefusingStore {
            inner: seeded(),
            refuse_title: "Broken",
        };
        let roots = store.get_tree().await.unwrap();
        let tree = vec![GeneratedNode::folder(
            "Bookmarks bar",
            vec![
                GeneratedNode::folder("Broken", vec![GeneratedNode::bookmark("20")]),
                GeneratedNode::folder("Fine", vec![GeneratedNode::bookmark("11")]),
                GeneratedNode::bookmark("404"),
            ],
        )];

        let report = apply_generated_tree(&store, &roots, &tree).await;

        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].kind, OperationKind::CreateFolder);
        assert_eq!(report.failures[1].kind, OperationKind::Move);
        assert_eq!(store.get("20").await.unwrap().parent_id.as_deref(), Some("2"));
        assert_eq!(report.bookmarks_moved, 1);
    }

    #[tokio::test]
    async fn unknown_top_level_titles_are_skipped() {
        let store = seeded();
        let roots = store.get_tree().await.unwrap();
        let tree = vec![GeneratedNode::folder(
            "Invented",
            vec![GeneratedNode::bookmark("10")],
        )];

        let report = apply_generated_tree(&store, &roots, &tree).await;
        assert_eq!(report, ApplyReport::default());
        assert_eq!(store.get("10").await.unwrap().parent_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn batch_apply_writes_tags_then_moves() {
        let store = Arc::new(seeded());
        let tags = Arc::new(SqliteTagStore::open_in_memory().unwrap());
        let applier = BatchPlanApplier::new(store.clone(), tags.clone());

        let plan = vec![
            BookmarkOrganization {
                bookmark_id: "10".to_string(),
                url: Some("https://rust-lang.org".to_string()),
                new_parent_id: Some("12".to_string()),
                tags: Some(vec!["rust".to_string()]),
            },
            BookmarkOrganization {
                bookmark_id: "11".to_string(),
                url: None,
                new_parent_id: Some("1".to_string()),
                tags: Some(vec!["orphan".to_string()]),
            },
            BookmarkOrganization {
                bookmark_id: "404".to_string(),
                url: Some("https://gone.example".to_string()),
                new_parent_id: Some("12".to_string()),
                tags: None,
            },
        ];

        let report = applier.apply_batch(&plan).await.unwrap();

        let stored = tags.get_all().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].url, "https://rust-lang.org");
        assert_eq!(report.tags_updated, 1);
        assert_eq!(report.bookmarks_moved, 1);
        assert_eq!(report.moves_skipped, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(store.get("10").await.unwrap().parent_id.as_deref(), Some("12"));
    }
}
