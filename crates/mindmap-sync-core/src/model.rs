//! Mind-map document model.
//!
//! A `Document` owns exactly one root `Node`; every other node is owned by
//! exactly one parent through its `children` list. Records serialize as
//! camelCase JSON, both on disk and on the wire.

use serde::{Deserialize, Serialize};

/// Alias callers may use instead of the actual root id when inserting.
pub const ROOT_ALIAS: &str = "root";

/// Sync state of a local document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local copy matches the last acknowledged remote state
    Synced,
    /// Local changes are waiting in the operation queue
    #[default]
    Pending,
    /// Remote holds a newer copy that could not be applied yet
    Conflict,
    /// An operation for this document was parked after failing
    Error,
}

/// 2D canvas position of a node.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// File or link attached to a node. Upload mechanics live elsewhere;
/// the model only carries the reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Visual style of a node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<u32>,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub collapsed: bool,
}

/// One element of the mind-map tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub children: Vec<Node>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub style: NodeStyle,
}

impl Node {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            position: Position::default(),
            children: Vec::new(),
            attachments: Vec::new(),
            style: NodeStyle::default(),
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(Node::subtree_len).sum::<usize>()
    }
}

/// Partial update for a node. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<NodeStyle>,
}

impl NodePatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn position(x: f64, y: f64) -> Self {
        Self {
            position: Some(Position::new(x, y)),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.position.is_none()
            && self.attachments.is_none()
            && self.style.is_none()
    }

    /// Fold a later patch into this one; fields set in `later` win.
    pub fn merge(&mut self, later: NodePatch) {
        if later.text.is_some() {
            self.text = later.text;
        }
        if later.position.is_some() {
            self.position = later.position;
        }
        if later.attachments.is_some() {
            self.attachments = later.attachments;
        }
        if later.style.is_some() {
            self.style = later.style;
        }
    }

    pub(crate) fn apply_to(&self, node: &mut Node) {
        if let Some(text) = &self.text {
            node.text = text.clone();
        }
        if let Some(position) = self.position {
            node.position = position;
        }
        if let Some(attachments) = &self.attachments {
            node.attachments = attachments.clone();
        }
        if let Some(style) = &self.style {
            node.style = style.clone();
        }
    }
}

/// Per-document display settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSettings {
    pub layout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default)]
    pub show_grid: bool,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        Self {
            layout: "radial".to_string(),
            theme: None,
            show_grid: false,
        }
    }
}

/// A single mind map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub root_node: Node,
    #[serde(default)]
    pub settings: DocumentSettings,
    /// Logical clock, milliseconds since Unix epoch
    pub last_modified: u64,
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Bumped on every local write
    #[serde(default)]
    pub local_version: u64,
    /// Last version acknowledged by the remote, if ever synced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_version: Option<u64>,
    pub owner_id: String,
}

impl Document {
    /// Create a document with a fresh root node whose text is the title.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            root_node: Node::new(crate::ids::generate_node_id(), title.clone()),
            title,
            settings: DocumentSettings::default(),
            last_modified: 0,
            sync_status: SyncStatus::Pending,
            local_version: 0,
            cloud_version: None,
            owner_id: owner_id.into(),
        }
    }

    pub fn with_root(mut self, root: Node) -> Self {
        self.root_node = root;
        self
    }

    pub fn root_id(&self) -> &str {
        &self.root_node.id
    }

    /// Summary as the remote list endpoint reports it.
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            updated_at: self.last_modified,
            origin: None,
        }
    }
}

/// Entry of the remote document list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    /// Remote `lastModified`, milliseconds since Unix epoch
    pub updated_at: u64,
    /// Client id of the last writer, when the remote records it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}
