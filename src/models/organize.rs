use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One model suggestion from the per-bookmark batch flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizeSuggestion {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub folder: Option<String>,
}

/// Sparse patch against one bookmark: move, retag, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkOrganization {
    pub bookmark_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl BookmarkOrganization {
    pub fn has_tags(&self) -> bool {
        self.tags.as_ref().is_some_and(|tags| !tags.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.new_parent_id.is_none() && !self.has_tags()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizePhase {
    Processing,
    Applying,
    BatchFailed,
    NothingToDo,
    Completed,
}

impl OrganizePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::NothingToDo | Self::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizeProgress {
    pub phase: OrganizePhase,
    pub current_batch: usize,
    pub total_batches: usize,
    pub processed_count: usize,
    pub total_count: usize,
    pub current_status: String,
}

/// Tags and a folder proposed for a single bookmark. `folder_id` is set only
/// when the proposed title names an existing folder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkSuggestion {
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
}

/// Folder-only projection of the live tree handed to the model as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderOutline {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FolderOutline>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkRef {
    pub id: String,
    pub title: String,
}

/// A node of a model-generated bookmark tree. Folders are identified by title
/// only; bookmarks reference an existing store id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GeneratedNode {
    Bookmark {
        id: String,
    },
    Folder {
        title: String,
        children: Vec<GeneratedNode>,
    },
}

impl GeneratedNode {
    pub fn folder(title: &str, children: Vec<GeneratedNode>) -> Self {
        Self::Folder {
            title: title.to_string(),
            children,
        }
    }

    pub fn bookmark(id: &str) -> Self {
        Self::Bookmark { id: id.to_string() }
    }

    /// Classifies an untrusted JSON object. An `id` (string or number) makes
    /// it a bookmark reference, otherwise a string `title` makes it a folder.
    /// Anything else yields `None`, and invalid children are dropped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;

        let id = match object.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => Some(id.trim().to_string()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        if let Some(id) = id {
            return Some(Self::Bookmark { id });
        }

        let title = object.get("title")?.as_str()?.trim();
        if title.is_empty() {
            return None;
        }
        let children = object
            .get("children")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Self::from_value).collect())
            .unwrap_or_default();

        Some(Self::Folder {
            title: title.to_string(),
            children,
        })
    }

    /// Parses a forest. A single top-level object is accepted as a forest of
    /// one, and `{"tree": [...]}`-style wrappers are unwrapped.
    pub fn forest_from_value(value: &Value) -> Vec<Self> {
        match value {
            Value::Array(items) => items.iter().filter_map(Self::from_value).collect(),
            Value::Object(object) => {
                let wrapped = ["tree", "bookmarks", "folders", "children"]
                    .iter()
                    .find_map(|key| object.get(*key).filter(|v| v.is_array()));
                match wrapped {
                    Some(inner) if !object.contains_key("title") => {
                        Self::forest_from_value(inner)
                    }
                    _ => Self::from_value(value).into_iter().collect(),
                }
            }
            _ => Vec::new(),
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            Self::Folder { title, .. } => Some(title),
            Self::Bookmark { .. } => None,
        }
    }

    pub fn children(&self) -> &[GeneratedNode] {
        match self {
            Self::Folder { children, .. } => children,
            Self::Bookmark { .. } => &[],
        }
    }
}
