use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::data::tag_store::TagStore;
use crate::error::AppError;
use crate::models::bookmark::{BookmarkEvent, BookmarkNode, BookmarkTag};

/// Keeps tag records keyed by the right url as bookmarks change.
///
/// Tags are stored by url but bookmark events carry ids, so an id → url
/// shadow map is kept to know which record a changed bookmark used to own.
pub struct TagSync {
    id_to_url: HashMap<String, String>,
    tags: Arc<dyn TagStore>,
}

fn collect_urls(node: &BookmarkNode, out: &mut Vec<(String, String)>) {
    if let Some(url) = &node.url {
        out.push((node.id.clone(), url.clone()));
    }
    for child in node.children.iter().flatten() {
        collect_urls(child, out);
    }
}

impl TagSync {
    pub fn new(tags: Arc<dyn TagStore>) -> Self {
        Self {
            id_to_url: HashMap::new(),
            tags,
        }
    }

    pub fn initialize(&mut self, forest: &[BookmarkNode]) {
        let mut pairs = Vec::new();
        for root in forest {
            collect_urls(root, &mut pairs);
        }
        self.id_to_url = pairs.into_iter().collect();
        tracing::debug!(count = self.id_to_url.len(), "tag sync initialized");
    }

    pub fn url_for(&self, id: &str) -> Option<&str> {
        self.id_to_url.get(id).map(String::as_str)
    }

    pub fn handle_event(&mut self, event: &BookmarkEvent) -> Result<(), AppError> {
        match event {
            BookmarkEvent::Created { id, node } => {
                if let Some(url) = &node.url {
                    self.id_to_url.insert(id.clone(), url.clone());
                }
            }
            BookmarkEvent::Removed { id, node, .. } => {
                if node.url.is_none() {
                    let mut pairs = Vec::new();
                    collect_urls(node, &mut pairs);
                    let urls: Vec<String> = pairs.iter().map(|(_, url)| url.clone()).collect();
                    self.tags.batch_delete(&urls)?;
                    for (bookmark_id, _) in &pairs {
                        self.id_to_url.remove(bookmark_id);
                    }
                    tracing::debug!(folder_id = %id, removed = urls.len(), "dropped tags for removed folder");
                } else {
                    let url = node.url.clone().or_else(|| self.id_to_url.get(id).cloned());
                    if let Some(url) = url {
                        self.tags.delete(&url)?;
                    }
                    self.id_to_url.remove(id);
                }
            }
            BookmarkEvent::Changed { id, url, .. } => {
                let Some(new_url) = url else {
                    return Ok(());
                };
                let old_url = self.id_to_url.get(id).cloned();
                if old_url.as_ref() == Some(new_url) {
                    return Ok(());
                }

                if let Some(old_url) = old_url {
                    if let Some(record) = self.tags.get(&old_url)? {
                        self.tags.delete(&old_url)?;
                        self.tags.put(&BookmarkTag {
                            url: new_url.clone(),
                            tags: record.tags,
                        })?;
                        tracing::debug!(bookmark_id = %id, from = %old_url, to = %new_url, "migrated tags to new url");
                    }
                }
                self.id_to_url.insert(id.clone(), new_url.clone());
            }
            BookmarkEvent::Moved { .. } => {}
        }
        Ok(())
    }
}

/// Applies store events until the channel closes, then hands the state back.
pub async fn run_tag_sync(
    mut events: broadcast::Receiver<BookmarkEvent>,
    mut sync: TagSync,
) -> TagSync {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(e) = sync.handle_event(&event) {
                    tracing::error!(error = %e, event = ?event, "tag sync failed for event");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "tag sync lagged behind bookmark events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    sync
}
