//! Expression value rendering
//!
//! Builds the plain-text and HTML display forms of a result value from the
//! debugger's value-child enumeration, without invoking any language-level
//! formatter. Ordered sequences, key-value mappings and small structured
//! records render as tables; everything else falls back to the summary
//! string. Both forms are always produced so the client picks the richer one
//! it understands.

use serde_json::{Map, Value};

use crate::debugger::ValueNode;

/// Row limit for sequence renderings
pub const MAX_SEQUENCE_ROWS: usize = 100;
/// Row limit for mapping renderings
pub const MAX_MAPPING_ROWS: usize = 100;
/// Row limit for record renderings
pub const MAX_RECORD_ROWS: usize = 50;

/// Display forms of one result value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedValue {
    /// Swift type name
    pub type_name: String,
    /// text/plain form
    pub text: String,
    /// text/html form
    pub html: String,
}

impl RenderedValue {
    /// MIME bundle for an `execute_result` message
    pub fn mime_bundle(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("text/plain".to_string(), Value::String(self.text.clone()));
        data.insert("text/html".to_string(), Value::String(self.html.clone()));
        data
    }
}

enum DisplayKind {
    Sequence,
    Mapping,
    Record,
    Plain,
}

fn classify(node: &ValueNode) -> DisplayKind {
    if node.children.is_empty() {
        return DisplayKind::Plain;
    }
    let t = node.type_name.as_str();
    let is_dictionary = t.starts_with("Dictionary<") || (t.starts_with('[') && t.contains(':'));
    let is_array = t.starts_with("Array<") || (t.starts_with('[') && !t.contains(':'));

    if is_array {
        if node.children.len() > MAX_SEQUENCE_ROWS {
            return DisplayKind::Plain;
        }
        return DisplayKind::Sequence;
    }
    if is_dictionary {
        if node.children.len() > MAX_MAPPING_ROWS {
            return DisplayKind::Plain;
        }
        return DisplayKind::Mapping;
    }
    if node.children.len() <= MAX_RECORD_ROWS {
        return DisplayKind::Record;
    }
    DisplayKind::Plain
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn html_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut html = String::from("<table><thead><tr>");
    for header in headers {
        html.push_str(&format!("<th>{}</th>", escape_html(header)));
    }
    html.push_str("</tr></thead><tbody>");
    for row in rows {
        html.push_str("<tr>");
        for cell in row {
            html.push_str(&format!("<td>{}</td>", escape_html(cell)));
        }
        html.push_str("</tr>");
    }
    html.push_str("</tbody></table>");
    html
}

fn text_table(rows: &[Vec<String>]) -> String {
    rows.iter()
        .map(|row| row.join("  "))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a result value into its display forms
pub fn render(node: &ValueNode) -> RenderedValue {
    let (text, html) = match classify(node) {
        DisplayKind::Sequence => {
            let rows: Vec<Vec<String>> = node
                .children
                .iter()
                .enumerate()
                .map(|(index, child)| vec![index.to_string(), child.summary.clone()])
                .collect();
            (text_table(&rows), html_table(&["Index", "Value"], &rows))
        }
        DisplayKind::Mapping => {
            let rows: Vec<Vec<String>> = node
                .children
                .iter()
                .map(|child| vec![child.name.clone(), child.summary.clone()])
                .collect();
            (text_table(&rows), html_table(&["Key", "Value"], &rows))
        }
        DisplayKind::Record => {
            let rows: Vec<Vec<String>> = node
                .children
                .iter()
                .map(|child| {
                    vec![
                        child.name.clone(),
                        child.type_name.clone(),
                        child.summary.clone(),
                    ]
                })
                .collect();
            (
                text_table(&rows),
                html_table(&["Field", "Type", "Value"], &rows),
            )
        }
        DisplayKind::Plain => (
            node.summary.clone(),
            format!("<pre>{}</pre>", escape_html(&node.summary)),
        ),
    };
    RenderedValue {
        type_name: node.type_name.clone(),
        text,
        html,
    }
}
