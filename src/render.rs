//! Document tree to flat markup.
//!
//! The vocabulary is small on purpose: `*bold*`, `_italic_`, `` `code` ``,
//! fenced blocks, `•` bullets, numbered items, `[text](url)` links and `>`
//! quotes. Downstream adapters translate it into their native rich text.

use serde_json::{Map, Value};

use crate::models::{Block, ContentPart, DocumentTree};

const THINKING_PART: &str = "thinking";
const TASK_PART: &str = "task";

/// Render a snapshot. Pure: the same tree always yields the same string.
pub fn render(tree: &DocumentTree) -> String {
    render_blocks(&tree.blocks, false).trim().to_string()
}

/// Render a snapshot that is still growing.
///
/// The last block in document order is open: its closing delimiters are left
/// off and a trailing content part is held back. The result is a prefix of
/// the rendering of any later snapshot that grows at the end, and of the
/// final [`render`].
pub fn render_open(tree: &DocumentTree) -> String {
    render_blocks(&tree.blocks, true).trim().to_string()
}

/// Render a document still in wire form.
pub fn render_wire(wire: &Value) -> String {
    render(&DocumentTree::from_wire(wire))
}

fn render_blocks(blocks: &[Block], open: bool) -> String {
    let last = blocks.len().saturating_sub(1);
    blocks
        .iter()
        .enumerate()
        .map(|(i, block)| render_block(block, open && i == last))
        .collect()
}

fn render_block(block: &Block, open: bool) -> String {
    match block {
        Block::Text { text } => text.clone(),
        Block::ContentPart { .. } if open => String::new(),
        Block::ContentPart { part } => render_part(part),
        Block::Code { language, code } => {
            fence(language.as_deref().unwrap_or_default(), code, open)
        }
        Block::Element {
            tag,
            attributes,
            children,
        } => match tag.as_str() {
            "ol" => render_ordered(children, open),
            "br" => "\n".to_string(),
            "hr" => "\n---\n".to_string(),
            "pre" => fence("", &render_blocks(children, open), open),
            "blockquote" => {
                let inner = render_blocks(children, open);
                if open {
                    format!("\n{}", quote(inner.trim_start()).trim_end())
                } else {
                    format!("\n{}\n", quote(inner.trim()))
                }
            }
            _ => {
                let (before, after) = delimiters(tag, attributes);
                let mut out = before;
                out.push_str(&render_blocks(children, open));
                if !open {
                    out.push_str(&after);
                }
                out
            }
        },
    }
}

/// Markup placed around an element's children.
fn delimiters(tag: &str, attributes: &Map<String, Value>) -> (String, String) {
    let pair = |before: &str, after: &str| (before.to_string(), after.to_string());
    match tag {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => pair("\n*", "*\n"),
        "p" => pair("\n", "\n"),
        "code" => pair("`", "`"),
        "strong" | "b" => pair("*", "*"),
        "em" | "i" => pair("_", "_"),
        "ul" => pair("\n", ""),
        "li" => pair("• ", "\n"),
        "a" => match attributes.get("href").and_then(Value::as_str) {
            Some(href) if !href.is_empty() => ("[".to_string(), format!("]({})", href)),
            _ => pair("", ""),
        },
        // Unknown tags keep their content without formatting.
        _ => pair("", ""),
    }
}

fn render_ordered(items: &[Block], open: bool) -> String {
    let mut out = String::from("\n");
    let last = items.len().saturating_sub(1);
    let mut n = 0;
    for (i, item) in items.iter().enumerate() {
        let open = open && i == last;
        match item {
            Block::Element { tag, children, .. } if tag == "li" => {
                n += 1;
                out.push_str(&format!("{}. {}", n, render_blocks(children, open)));
                if !open {
                    out.push('\n');
                }
            }
            other => out.push_str(&render_block(other, open)),
        }
    }
    out
}

fn render_part(part: &ContentPart) -> String {
    let title = part.title.as_deref().unwrap_or_default();
    let content = part.content.as_deref().filter(|c| !c.is_empty());

    match part.kind.as_str() {
        THINKING_PART => {
            let mut out = format!("\n> *💭 Thinking: {}*", title);
            if let Some(secs) = part.duration.filter(|d| *d > 0.0) {
                out.push_str(&format!(" _({}s)_", secs.round() as u64));
            }
            if let Some(content) = content {
                out.push('\n');
                out.push_str(&quote(&format!("_{}_", content)));
            }
            out
        }
        TASK_PART => {
            let mut out = format!("\n*✓ {}*", title);
            if let Some(content) = content {
                out.push_str(&format!("\n_{}_", content));
            }
            out
        }
        // Progress parts are reported as status lines by the task extractor.
        _ => String::new(),
    }
}

fn fence(language: &str, code: &str, open: bool) -> String {
    let mut out = format!("\n```{}\n{}", language, code);
    if !open {
        out.push_str("\n```\n");
    }
    out
}

fn quote(text: &str) -> String {
    text.lines()
        .map(|line| format!("> {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}
