use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Tag of a wire element carrying a content part in its `part` attribute.
pub const CONTENT_PART_TAG: &str = "AssistantMessageContentPart";
/// Tag of a wire element carrying a fenced code block.
pub const CODE_BLOCK_TAG: &str = "Codeblock";
/// Tag of a wire element carrying plain text as its first child.
pub const TEXT_TAG: &str = "text";

const CONTENT_ROW: u64 = 0;

// ============================================================================
// Document Tree
// ============================================================================

/// Typed view of one snapshot of the streamed document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentTree {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    Element {
        tag: String,
        attributes: Map<String, Value>,
        children: Vec<Block>,
    },
    ContentPart {
        part: ContentPart,
    },
    Code {
        language: Option<String>,
        code: String,
    },
}

impl DocumentTree {
    /// Build the typed view from the wire form: an array of `[row_type, payload]`
    /// rows where only content rows (type 0) carry elements.
    pub fn from_wire(wire: &Value) -> Self {
        let Some(rows) = wire.as_array() else {
            return Self::default();
        };

        let blocks = rows
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                if row.first().and_then(Value::as_u64) != Some(CONTENT_ROW) {
                    return None;
                }
                row.get(1).and_then(Value::as_array)
            })
            .flat_map(|elements| elements.iter().filter_map(Block::from_wire))
            .collect();

        Self { blocks }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Every content part in document order, nested elements included.
    pub fn content_parts(&self) -> Vec<&ContentPart> {
        let mut parts = Vec::new();
        collect_parts(&self.blocks, &mut parts);
        parts
    }
}

fn collect_parts<'a>(blocks: &'a [Block], out: &mut Vec<&'a ContentPart>) {
    for block in blocks {
        match block {
            Block::ContentPart { part } => out.push(part),
            Block::Element { children, .. } => collect_parts(children, out),
            Block::Text { .. } | Block::Code { .. } => {}
        }
    }
}

impl Block {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn from_wire(element: &Value) -> Option<Self> {
        if let Some(text) = element.as_str() {
            return Some(Self::text(text));
        }

        let items = element.as_array()?;
        let tag = items.first().and_then(Value::as_str).filter(|t| !t.is_empty())?;
        let attributes = items
            .get(1)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let children = items.get(2..).unwrap_or_default();

        let block = match tag {
            CONTENT_PART_TAG => {
                let part = attributes.get("part")?;
                match ContentPart::from_value(part) {
                    Some(part) => Self::ContentPart { part },
                    None => {
                        log::debug!("Skipping unreadable content part: {}", part);
                        return None;
                    }
                }
            }
            CODE_BLOCK_TAG => Self::Code {
                language: attributes
                    .get("lang")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                code: first_string(children),
            },
            TEXT_TAG => Self::text(first_string(children)),
            _ => Self::Element {
                tag: tag.to_string(),
                children: children.iter().filter_map(Self::from_wire).collect(),
                attributes,
            },
        };

        Some(block)
    }
}

fn first_string(children: &[Value]) -> String {
    children
        .first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// ============================================================================
// Content Parts
// ============================================================================

/// A progress or commentary part. Fields are read leniently: a scalar of the
/// wrong type is converted, anything else counts as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentPart {
    #[serde(rename = "type", deserialize_with = "lenient_kind")]
    pub kind: String,
    #[serde(deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub content: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub task_name_active: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub task_name_complete: Option<String>,
    pub finished_at: Option<Value>,
    #[serde(deserialize_with = "lenient_number")]
    pub duration: Option<f64>,
    #[serde(deserialize_with = "lenient_parts")]
    pub parts: Vec<SubPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubPart {
    #[serde(rename = "type", deserialize_with = "lenient_kind")]
    pub kind: String,
    #[serde(deserialize_with = "lenient_number")]
    pub duration: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_kind<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}

fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_parts<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<SubPart>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

impl ContentPart {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.as_ref().is_some_and(|v| !v.is_null())
    }
}

// ============================================================================
// Response Metadata
// ============================================================================

/// Out-of-band information about the overall response (`{"object": ...}` frames).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub demo_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseMetadata {
    /// Fold a later frame into this one; only present, non-empty fields overwrite.
    pub fn merge(&mut self, other: &ResponseMetadata) {
        fn take(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value.as_ref().filter(|v| !v.is_empty()) {
                *slot = Some(v.clone());
            }
        }

        if !other.object.is_empty() {
            self.object = other.object.clone();
        }
        take(&mut self.id, &other.id);
        take(&mut self.name, &other.name);
        take(&mut self.web_url, &other.web_url);
        take(&mut self.demo_url, &other.demo_url);
        for (k, v) in &other.extra {
            self.extra.insert(k.clone(), v.clone());
        }
    }
}

// ============================================================================
// Action Elements
// ============================================================================

/// Link attached to the live message when it is stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionElement {
    pub text: String,
    pub url: String,
    pub action_id: String,
}

impl ActionElement {
    pub fn from_metadata(metadata: &ResponseMetadata) -> Vec<Self> {
        let mut actions = Vec::new();
        if let Some(url) = &metadata.web_url {
            actions.push(Self {
                text: "Open chat".to_string(),
                url: url.clone(),
                action_id: "open_chat_action".to_string(),
            });
        }
        if let Some(url) = &metadata.demo_url {
            actions.push(Self {
                text: "View demo".to_string(),
                url: url.clone(),
                action_id: "view_demo_action".to_string(),
            });
        }
        actions
    }
}
