use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::bookmark::{BookmarkNode, BookmarkTreeNode};
use crate::models::organize::{
    BookmarkOrganization, BookmarkRef, FolderOutline, GeneratedNode, OrganizeSuggestion,
};
use crate::services::extract_service::collect_bookmarks_by_id;

pub const BOOKMARKS_BAR_TITLES: &[&str] = &["Bookmarks bar", "书签栏"];
pub const OTHER_BOOKMARKS_TITLES: &[&str] = &["Other bookmarks", "其他书签"];
pub const DEFAULT_BAR_TITLE: &str = "Bookmarks bar";
pub const UNKNOWN_BOOKMARK_TITLE: &str = "Unknown Bookmark";

/// Which browser-owned root a generated top-level title stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootRole {
    BookmarksBar,
    OtherBookmarks,
}

pub fn root_role(title: &str) -> Option<RootRole> {
    if BOOKMARKS_BAR_TITLES.contains(&title) {
        Some(RootRole::BookmarksBar)
    } else if OTHER_BOOKMARKS_TITLES.contains(&title) {
        Some(RootRole::OtherBookmarks)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Per-bookmark batch plan
// ---------------------------------------------------------------------------

/// Folder title → id over the whole structure, depth-first. When two folders
/// share a title the one visited last wins.
pub fn build_folder_id_map(structure: &[FolderOutline]) -> HashMap<String, String> {
    fn visit(nodes: &[FolderOutline], map: &mut HashMap<String, String>) {
        for node in nodes {
            map.insert(node.title.clone(), node.id.clone());
            if let Some(children) = &node.children {
                visit(children, map);
            }
        }
    }

    let mut map = HashMap::new();
    visit(structure, &mut map);
    map
}

/// Turns model suggestions into sparse patches. A suggestion whose bookmark
/// url cannot be resolved is dropped; an unknown folder only drops the move.
pub fn generate_organize_plan(
    suggestions: &[OrganizeSuggestion],
    folder_map: &HashMap<String, String>,
    id_to_url: &HashMap<String, String>,
) -> Vec<BookmarkOrganization> {
    let mut plan = Vec::with_capacity(suggestions.len());

    for suggestion in suggestions {
        let Some(url) = id_to_url.get(&suggestion.id) else {
            tracing::warn!(
                bookmark_id = %suggestion.id,
                "url not found for suggested bookmark, skipping"
            );
            continue;
        };

        let new_parent_id = suggestion.folder.as_ref().and_then(|folder| {
            let id = folder_map.get(folder).cloned();
            if id.is_none() {
                tracing::warn!(
                    bookmark_id = %suggestion.id,
                    folder = %folder,
                    "folder not found, keeping bookmark in place"
                );
            }
            id
        });

        let item = BookmarkOrganization {
            bookmark_id: suggestion.id.clone(),
            url: Some(url.clone()),
            new_parent_id,
            tags: (!suggestion.tags.is_empty()).then(|| suggestion.tags.clone()),
        };
        if item.is_empty() {
            tracing::debug!(bookmark_id = %item.bookmark_id, "suggestion carries no change");
            continue;
        }
        plan.push(item);
    }

    plan
}

// ---------------------------------------------------------------------------
// Full-tree reconciliation
// ---------------------------------------------------------------------------

fn take_children(node: &mut GeneratedNode) -> Vec<GeneratedNode> {
    match node {
        GeneratedNode::Folder { children, .. } => std::mem::take(children),
        GeneratedNode::Bookmark { .. } => Vec::new(),
    }
}

fn extend_folder(target: &mut GeneratedNode, more: Vec<GeneratedNode>) {
    if let GeneratedNode::Folder { children, .. } = target {
        children.extend(more);
    }
}

/// Merges same-titled sibling folders into their first instance, at every
/// level below `nodes`.
fn merge_duplicate_folders(nodes: Vec<GeneratedNode>) -> Vec<GeneratedNode> {
    let mut merged: Vec<GeneratedNode> = Vec::with_capacity(nodes.len());
    let mut by_title: HashMap<String, usize> = HashMap::new();

    for mut node in nodes {
        let Some(title) = node.title().map(str::to_string) else {
            merged.push(node);
            continue;
        };
        match by_title.get(&title) {
            Some(&pos) => {
                let children = take_children(&mut node);
                extend_folder(&mut merged[pos], children);
            }
            None => {
                by_title.insert(title, merged.len());
                merged.push(node);
            }
        }
    }

    for node in &mut merged {
        if let GeneratedNode::Folder { children, .. } = node {
            *children = merge_duplicate_folders(std::mem::take(children));
        }
    }
    merged
}

/// Folds a generated forest onto the real roots. Bookmarks-bar and
/// other-bookmarks variants collapse into one container each; existing
/// top-level titles are kept. Loose bookmark refs and the children of
/// unrecognized folders go into the bar, and unrecognized empty folders are
/// dropped.
pub fn reconcile_generated_tree(
    nodes: Vec<GeneratedNode>,
    existing_top_level: &[String],
) -> Vec<GeneratedNode> {
    let mut out: Vec<GeneratedNode> = Vec::new();
    let mut bar_pos: Option<usize> = None;
    let mut other_pos: Option<usize> = None;
    let mut kept_pos: HashMap<String, usize> = HashMap::new();

    fn bar_slot(out: &mut Vec<GeneratedNode>, bar_pos: &mut Option<usize>, title: &str) -> usize {
        *bar_pos.get_or_insert_with(|| {
            out.push(GeneratedNode::folder(title, Vec::new()));
            out.len() - 1
        })
    }

    for mut node in nodes {
        let title = match &node {
            GeneratedNode::Bookmark { id } => {
                tracing::debug!(bookmark_id = %id, "folding top-level bookmark into bookmarks bar");
                let pos = bar_slot(&mut out, &mut bar_pos, DEFAULT_BAR_TITLE);
                extend_folder(&mut out[pos], vec![node]);
                continue;
            }
            GeneratedNode::Folder { title, .. } => title.clone(),
        };

        match root_role(&title) {
            Some(RootRole::BookmarksBar) => {
                let pos = bar_slot(&mut out, &mut bar_pos, &title);
                let children = take_children(&mut node);
                extend_folder(&mut out[pos], children);
            }
            Some(RootRole::OtherBookmarks) => {
                let pos = *other_pos.get_or_insert_with(|| {
                    out.push(GeneratedNode::folder(&title, Vec::new()));
                    out.len() - 1
                });
                let children = take_children(&mut node);
                extend_folder(&mut out[pos], children);
            }
            None if existing_top_level.iter().any(|existing| existing == &title) => {
                match kept_pos.get(&title) {
                    Some(&pos) => {
                        let children = take_children(&mut node);
                        extend_folder(&mut out[pos], children);
                    }
                    None => {
                        kept_pos.insert(title, out.len());
                        out.push(node);
                    }
                }
            }
            None if !node.children().is_empty() => {
                tracing::debug!(folder = %title, "spreading unrecognized top-level folder into bookmarks bar");
                let pos = bar_slot(&mut out, &mut bar_pos, DEFAULT_BAR_TITLE);
                let children = take_children(&mut node);
                extend_folder(&mut out[pos], children);
            }
            None => {
                tracing::info!(folder = %title, "dropping empty unrecognized top-level folder");
            }
        }
    }

    out.into_iter()
        .map(|mut node| {
            if let GeneratedNode::Folder { children, .. } = &mut node {
                *children = merge_duplicate_folders(std::mem::take(children));
            }
            node
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn existing_tags_text(tags: &[String]) -> String {
    if tags.is_empty() {
        "none".to_string()
    } else {
        tags.join(", ")
    }
}

pub fn build_organize_system_prompt(existing_tags: &[String], folders_json: &str) -> String {
    let tags_text = existing_tags_text(existing_tags);
    format!(
        "You are a bookmark organizing assistant. You will receive a batch of bookmarks\n\
(id, title and URL). For every bookmark suggest relevant tags and the single most\n\
suitable existing folder.\n\
\n\
Rules:\n\
1. Tags\n\
   - Give each bookmark 2-5 tags.\n\
   - Prefer tags from the existing tag list; do not create duplicates or near-duplicates.\n\
   - Write tags in Chinese unless they are proper nouns or technical terms.\n\
2. Folder\n\
   - Pick exactly one folder from the existing folder structure below.\n\
   - Return the folder's `title` exactly as written. Never return a path, never\n\
     translate or rewrite the name.\n\
   - If no folder fits, the folder value MUST be null.\n\
   - Never invent or guess a folder that does not exist.\n\
3. Output\n\
   - Your whole answer MUST be a bare JSON array with no markdown, comments or other text.\n\
   - Format: [{{ \"id\": \"<bookmark id>\", \"tags\": [\"tag1\", \"tag2\"], \"folder\": \"<folder title or null>\" }}]\n\
\n\
Existing tags:\n\
{tags_text}\n\
\n\
Existing folder structure:\n\
```json\n\
{folders_json}\n\
```"
    )
}

pub fn build_organize_user_prompt<N: BookmarkTreeNode>(batch: &[&N]) -> String {
    let lines = batch
        .iter()
        .map(|bookmark| {
            format!(
                "ID: {}, Title: \"{}\", URL: {}",
                bookmark.id(),
                bookmark.title(),
                bookmark.url().unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("Suggest tags and a folder for these bookmarks:\n\n{lines}")
}

pub fn build_suggestion_system_prompt(existing_tags: &[String], folders_json: &str) -> String {
    let tags_text = existing_tags_text(existing_tags);
    format!(
        "You are a bookmark organizing assistant. You will receive one bookmark (title and URL).\n\
Suggest relevant tags and the single most suitable existing folder for it.\n\
\n\
Rules:\n\
1. Give 2-5 tags. Prefer tags from the existing tag list and avoid near-duplicates.\n\
   Write tags in Chinese unless they are proper nouns or technical terms.\n\
2. Pick exactly one folder from the existing folder structure and return its `title`\n\
   exactly as written, e.g. \"AI编程\". Never return a path or a translated name.\n\
   If no folder fits, return null. Never invent a folder.\n\
3. Your whole answer MUST be a bare JSON object with no markdown or other text:\n\
   {{ \"tags\": [\"tag1\", \"tag2\"], \"folder\": \"AI编程\" }} or\n\
   {{ \"tags\": [\"tag1\", \"tag2\"], \"folder\": null }}\n\
\n\
Existing tags:\n\
{tags_text}\n\
\n\
Existing folder structure:\n\
```json\n\
{folders_json}\n\
```"
    )
}

pub fn build_suggestion_user_prompt(title: &str, url: &str) -> String {
    format!("Suggest tags and a folder for this bookmark:\n\nTitle: \"{title}\", URL: {url}")
}

/// Tag-only prompt; the answer is a plain comma-separated list.
pub fn build_tag_generation_prompt(existing_tags: &[String]) -> String {
    let tags_text = existing_tags_text(existing_tags);
    format!(
        "You are a bookmark tagging assistant. You will receive one bookmark (title and URL).\n\
Suggest tags for it.\n\
\n\
Rules:\n\
1. Prefer tags from the existing tag list and do not create duplicates or near-duplicates.\n\
2. Give 2-5 short tags.\n\
3. Write tags in Chinese unless they are proper nouns or technical terms.\n\
4. Answer with the tags as plain text separated by commas, with no other text.\n\
\n\
Example:\n\
Title: \"React 官方文档\", URL: https://reactjs.org/docs\n\
Answer: React, 前端开发, JavaScript, 官方文档, 技术文档\n\
\n\
Existing tags:\n\
{tags_text}"
    )
}

pub fn build_tag_generation_user_prompt(title: &str, url: &str) -> String {
    format!("Title: \"{title}\", URL: {url}")
}

pub fn build_tree_system_prompt(folders_json: &str) -> String {
    format!(
        "You reorganize a browser's bookmarks into a clean folder tree.\n\
\n\
The user's current folder structure is:\n\
```json\n\
{folders_json}\n\
```\n\
\n\
You will receive the bookmarks grouped by their current folder path, each with\n\
its id and title.\n\
\n\
Rules:\n\
1. Keep the top-level containers \"Bookmarks bar\" and \"Other bookmarks\" (or the\n\
   localized titles used above). Put every new folder inside one of them.\n\
2. Reuse meaningful existing folders; create new ones only when they help.\n\
   Keep folder names short.\n\
3. Every bookmark id must appear exactly once. Never invent ids.\n\
4. A folder is {{ \"title\": \"...\", \"children\": [...] }}. A bookmark is {{ \"id\": \"...\" }}.\n\
5. Answer with a single JSON array of top-level folders and nothing else."
    )
}

pub fn build_tree_user_prompt(
    bookmarks_by_folder: &BTreeMap<String, Vec<BookmarkRef>>,
) -> Result<String, AppError> {
    let payload = serde_json::to_string_pretty(bookmarks_by_folder)?;
    Ok(format!(
        "Here is the list of my bookmarks. Please organize them for me:\n\n{payload}"
    ))
}

// ---------------------------------------------------------------------------
// Editable preview
// ---------------------------------------------------------------------------

/// A generated tree as shown to the user before applying. Folder ids are
/// synthetic and stable for a given tree; bookmark ids are store ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewNode {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<PreviewNode>>,
}

impl PreviewNode {
    pub fn is_folder(&self) -> bool {
        self.children.is_some()
    }
}

fn synthetic_folder_id(parent_key: &str, title: &str, ordinal: usize) -> String {
    let key = format!("{parent_key}/{title}#{ordinal}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

fn preview_level(
    nodes: &[GeneratedNode],
    parent_key: &str,
    live: &HashMap<String, &BookmarkNode>,
) -> Vec<PreviewNode> {
    nodes
        .iter()
        .enumerate()
        .map(|(ordinal, node)| match node {
            GeneratedNode::Bookmark { id } => match live.get(id) {
                Some(bookmark) => PreviewNode {
                    id: id.clone(),
                    title: bookmark.title.clone(),
                    url: bookmark.url.clone(),
                    children: None,
                },
                None => PreviewNode {
                    id: id.clone(),
                    title: UNKNOWN_BOOKMARK_TITLE.to_string(),
                    url: None,
                    children: None,
                },
            },
            GeneratedNode::Folder { title, children } => {
                let id = synthetic_folder_id(parent_key, title, ordinal);
                let nested = preview_level(children, &format!("{parent_key}/{title}"), live);
                PreviewNode {
                    id,
                    title: title.clone(),
                    url: None,
                    children: Some(nested),
                }
            }
        })
        .collect()
}

/// Resolves bookmark refs against the live tree for display.
pub fn build_preview(tree: &[GeneratedNode], live_forest: &[BookmarkNode]) -> Vec<PreviewNode> {
    let live = collect_bookmarks_by_id(live_forest);
    preview_level(tree, "", &live)
}

pub fn rename_preview_node(nodes: &mut [PreviewNode], id: &str, title: &str) -> bool {
    for node in nodes.iter_mut() {
        if node.id == id {
            node.title = title.to_string();
            return true;
        }
        if let Some(children) = node.children.as_mut() {
            if rename_preview_node(children, id, title) {
                return true;
            }
        }
    }
    false
}

/// Removes the node and everything under it.
pub fn remove_preview_node(nodes: &mut Vec<PreviewNode>, id: &str) -> bool {
    let before = nodes.len();
    nodes.retain(|node| node.id != id);
    if nodes.len() != before {
        return true;
    }
    nodes.iter_mut().any(|node| {
        node.children
            .as_mut()
            .is_some_and(|children| remove_preview_node(children, id))
    })
}

/// Appends an empty folder under `parent_id` and returns its id, or `None`
/// when the parent is missing or is a bookmark.
pub fn add_preview_folder(nodes: &mut [PreviewNode], parent_id: &str, title: &str) -> Option<String> {
    for node in nodes.iter_mut() {
        if node.id == parent_id {
            let children = node.children.as_mut()?;
            let id = synthetic_folder_id(parent_id, title, children.len());
            children.push(PreviewNode {
                id: id.clone(),
                title: title.to_string(),
                url: None,
                children: Some(Vec::new()),
            });
            return Some(id);
        }
        if let Some(children) = node.children.as_mut() {
            if let Some(id) = add_preview_folder(children, parent_id, title) {
                return Some(id);
            }
        }
    }
    None
}

/// Back to the applier's shape. Synthetic folder ids are discarded.
pub fn preview_to_generated(nodes: &[PreviewNode]) -> Vec<GeneratedNode> {
    nodes
        .iter()
        .map(|node| match &node.children {
            Some(children) => GeneratedNode::folder(&node.title, preview_to_generated(children)),
            None => GeneratedNode::bookmark(&node.id),
        })
        .collect()
}
