use serde::{Deserialize, Serialize};

/// Read-only view over anything shaped like a browser bookmark tree node.
///
/// Implemented for both the raw store node and the tag-enhanced view so the
/// extractors can walk either forest.
pub trait BookmarkTreeNode {
    fn id(&self) -> &str;
    fn title(&self) -> &str;
    fn url(&self) -> Option<&str>;
    fn child_nodes(&self) -> Option<&[Self]>
    where
        Self: Sized;

    fn is_folder(&self) -> bool {
        self.url().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkNode {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub date_added: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_group_modified: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<BookmarkNode>>,
}

impl BookmarkNode {
    pub fn folder(id: &str, title: &str, children: Vec<BookmarkNode>) -> Self {
        let children = children
            .into_iter()
            .enumerate()
            .map(|(index, mut child)| {
                child.parent_id = Some(id.to_string());
                child.index = index;
                child
            })
            .collect();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            url: None,
            parent_id: None,
            index: 0,
            date_added: 0,
            date_group_modified: None,
            children: Some(children),
        }
    }

    pub fn bookmark(id: &str, title: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            url: Some(url.to_string()),
            parent_id: None,
            index: 0,
            date_added: 0,
            date_group_modified: None,
            children: None,
        }
    }
}

impl BookmarkTreeNode for BookmarkNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    fn child_nodes(&self) -> Option<&[Self]> {
        self.children.as_deref()
    }
}

/// A bookmark node joined with its tag record. Rebuilt on every fetch, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedBookmark {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub date_added: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_group_modified: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_last_used: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<EnhancedBookmark>>,
}

impl BookmarkTreeNode for EnhancedBookmark {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    fn child_nodes(&self) -> Option<&[Self]> {
        self.children.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkTag {
    pub url: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDetails {
    pub parent_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveDestination {
    pub parent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookmarkChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Change notifications published by a bookmark store.
#[derive(Debug, Clone, PartialEq)]
pub enum BookmarkEvent {
    Created {
        id: String,
        node: BookmarkNode,
    },
    Removed {
        id: String,
        parent_id: String,
        node: BookmarkNode,
    },
    Changed {
        id: String,
        title: String,
        url: Option<String>,
    },
    Moved {
        id: String,
        parent_id: String,
        old_parent_id: String,
        index: usize,
        old_index: usize,
    },
}
