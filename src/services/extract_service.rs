use std::collections::{BTreeMap, HashMap};

use crate::models::bookmark::{BookmarkNode, BookmarkTreeNode, EnhancedBookmark};
use crate::models::organize::{BookmarkRef, FolderOutline};

pub const FOLDER_PATH_SEPARATOR: &str = " > ";

fn walk_folder<'a, N, F>(node: &'a N, path: &mut Vec<&'a str>, visit: &mut F)
where
    N: BookmarkTreeNode,
    F: FnMut(String, Vec<&'a N>),
{
    let Some(children) = node.child_nodes() else {
        return;
    };
    path.push(node.title());

    let bookmarks: Vec<&N> = children.iter().filter(|child| !child.is_folder()).collect();
    if !bookmarks.is_empty() {
        visit(path.join(FOLDER_PATH_SEPARATOR), bookmarks);
    }
    for subfolder in children.iter().filter(|child| child.is_folder()) {
        walk_folder(subfolder, path, visit);
    }

    path.pop();
}

/// Folder path → direct bookmark refs, only for folders that directly hold at
/// least one bookmark. Folders holding only subfolders are walked, not listed.
pub fn extract_bookmark_refs<N: BookmarkTreeNode>(forest: &[N]) -> BTreeMap<String, Vec<BookmarkRef>> {
    let mut by_folder = BTreeMap::new();
    let mut path = Vec::new();

    for root in forest.iter().filter(|node| node.is_folder()) {
        walk_folder(root, &mut path, &mut |key, bookmarks| {
            let refs = bookmarks
                .into_iter()
                .map(|b| BookmarkRef {
                    id: b.id().to_string(),
                    title: b.title().to_string(),
                })
                .collect();
            by_folder.insert(key, refs);
        });
    }

    by_folder
}

/// Folder path → direct bookmark titles, with the same inclusion rule as
/// [`extract_bookmark_refs`].
pub fn extract_folder_map<N: BookmarkTreeNode>(forest: &[N]) -> BTreeMap<String, Vec<String>> {
    extract_bookmark_refs(forest)
        .into_iter()
        .map(|(path, refs)| (path, refs.into_iter().map(|r| r.title).collect()))
        .collect()
}

/// Folder-only mirror of the tree. `children` is omitted for folders without
/// subfolders; bookmarks never count.
pub fn extract_folder_structure<N: BookmarkTreeNode>(forest: &[N]) -> Vec<FolderOutline> {
    forest
        .iter()
        .filter(|node| node.is_folder())
        .map(|node| {
            let children = node
                .child_nodes()
                .filter(|children| children.iter().any(|child| child.is_folder()))
                .map(|children| extract_folder_structure(children));
            FolderOutline {
                id: node.id().to_string(),
                title: node.title().to_string(),
                children,
            }
        })
        .collect()
}

/// Bookmarks sitting directly under a top-level folder, in tree order. Deeper
/// bookmarks are already filed and are left alone.
pub fn extract_root_bookmarks<N: BookmarkTreeNode>(forest: &[N]) -> Vec<&N> {
    let roots: Vec<&N> = forest
        .iter()
        .filter_map(|root| root.child_nodes())
        .flat_map(|children| children.iter().filter(|node| !node.is_folder()))
        .collect();
    tracing::debug!(count = roots.len(), "extracted root bookmarks");
    roots
}

/// Every bookmark (not folder) in the forest, keyed by store id.
pub fn collect_bookmarks_by_id<N: BookmarkTreeNode>(forest: &[N]) -> HashMap<String, &N> {
    fn visit<'a, N: BookmarkTreeNode>(nodes: &'a [N], out: &mut HashMap<String, &'a N>) {
        for node in nodes {
            if !node.is_folder() {
                out.insert(node.id().to_string(), node);
            }
            if let Some(children) = node.child_nodes() {
                visit(children, out);
            }
        }
    }

    let mut out = HashMap::new();
    visit(forest, &mut out);
    out
}

/// Joins the live tree with a tag snapshot by URL. Folders get no tags.
pub fn merge_tags(forest: &[BookmarkNode], tags_by_url: &HashMap<String, Vec<String>>) -> Vec<EnhancedBookmark> {
    forest
        .iter()
        .map(|node| EnhancedBookmark {
            id: node.id.clone(),
            title: node.title.clone(),
            url: node.url.clone(),
            parent_id: node.parent_id.clone(),
            index: node.index,
            date_added: node.date_added,
            date_group_modified: node.date_group_modified,
            tags: node
                .url
                .as_ref()
                .and_then(|url| tags_by_url.get(url).cloned())
                .unwrap_or_default(),
            date_last_used: None,
            children: node
                .children
                .as_ref()
                .map(|children| merge_tags(children, tags_by_url)),
        })
        .collect()
}
