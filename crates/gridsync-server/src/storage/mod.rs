//! Document storage.
//!
//! The store owns the name → document index and the persisted form of every
//! document. The trait is synchronous (no async): a session calls it while
//! holding the driver, and every backend completes in bounded time.
//!
//! A [`Document`] is a plain owned value. Sessions keep their working copy in
//! memory and hand it back to [`DocumentStore::save`] to persist.

mod chaotic;
mod error;
mod memory;
mod redb;

use std::collections::BTreeMap;

pub use chaotic::ChaoticStore;
pub use error::StoreError;
pub use memory::MemoryStore;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStore;

/// A named spreadsheet: password, optional version tag, and cell contents.
///
/// Cell keys are stored upper-cased. Unset cells read as the empty string and
/// setting a cell to the empty string removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    name: String,
    password: String,
    version_tag: Option<String>,
    cells: BTreeMap<String, String>,
}

impl Document {
    /// New empty document.
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            version_tag: None,
            cells: BTreeMap::new(),
        }
    }

    /// Document name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Access password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Text of a cell. Empty if unset.
    pub fn cell(&self, key: &str) -> &str {
        self.cells.get(&normalize_cell_key(key)).map_or("", String::as_str)
    }

    /// Set a cell's text. Empty text clears the cell.
    pub fn set_cell(&mut self, key: &str, text: impl Into<String>) {
        let key = normalize_cell_key(key);
        let text = text.into();
        if text.is_empty() {
            self.cells.remove(&key);
        } else {
            self.cells.insert(key, text);
        }
    }

    /// Non-empty cells in key order.
    pub fn cells(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cells.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Persisted snapshot label. Independent of any live session version.
    pub fn version_tag(&self) -> Option<&str> {
        self.version_tag.as_deref()
    }

    /// Set the snapshot label.
    pub fn set_version_tag(&mut self, tag: impl Into<String>) {
        self.version_tag = Some(tag.into());
    }

    /// Flattened XML rendering of every cell, declaration included.
    ///
    /// Whitespace runs are collapsed to a single space and the result is
    /// trimmed, so the snapshot is always a single line.
    pub fn render_snapshot(&self) -> String {
        let mut xml = String::from(XML_DECLARATION);
        xml.push('\n');
        xml.push_str("<spreadsheet");
        if let Some(tag) = &self.version_tag {
            xml.push_str(" version=\"");
            xml.push_str(&quick_xml::escape::escape(tag.as_str()));
            xml.push('"');
        }
        xml.push('>');

        for (key, text) in &self.cells {
            xml.push_str("<cell><name>");
            xml.push_str(&quick_xml::escape::escape(key.as_str()));
            xml.push_str("</name><contents>");
            xml.push_str(&quick_xml::escape::escape(text.as_str()));
            xml.push_str("</contents></cell>");
        }
        xml.push_str("</spreadsheet>");

        collapse_whitespace(&xml)
    }
}

/// Declaration that opens every snapshot.
pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Canonical form of a cell key.
pub fn normalize_cell_key(key: &str) -> String {
    key.to_uppercase()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Storage abstraction for named documents
///
/// Must be Clone (shared between the driver and tests), Send + Sync
/// (thread-safe), and synchronous. Implementations share internal state via
/// Arc, so clones access the same underlying store.
pub trait DocumentStore: Clone + Send + Sync + 'static {
    /// Create an empty document.
    ///
    /// # Errors
    ///
    /// `StoreError::AlreadyExists` if the name is taken.
    fn create(&self, name: &str, password: &str) -> Result<Document, StoreError>;

    /// Load a document by name.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if no document has this name.
    fn load(&self, name: &str) -> Result<Document, StoreError>;

    /// Persist a document, replacing the stored copy.
    fn save(&self, document: &Document) -> Result<(), StoreError>;

    /// Names of all stored documents, in no particular order.
    fn list_documents(&self) -> Result<Vec<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_cell_is_empty() {
        let doc = Document::new("s", "pw");
        assert_eq!(doc.cell("A1"), "");
    }

    #[test]
    fn cell_keys_ignore_case() {
        let mut doc = Document::new("s", "pw");
        doc.set_cell("b7", "x");

        assert_eq!(doc.cell("B7"), "x");
        assert_eq!(doc.cells().collect::<Vec<_>>(), vec![("B7", "x")]);
    }

    #[test]
    fn empty_text_clears_cell() {
        let mut doc = Document::new("s", "pw");
        doc.set_cell("A1", "1");
        doc.set_cell("A1", "");
        assert_eq!(doc.cells().count(), 0);
    }

    fn declared(body: &str) -> String {
        format!("{XML_DECLARATION} {body}")
    }

    #[test]
    fn snapshot_of_empty_document() {
        let snapshot = Document::new("s", "pw").render_snapshot();
        assert_eq!(snapshot, declared("<spreadsheet></spreadsheet>"));
        assert_eq!(snapshot.len(), 66);
    }

    #[test]
    fn snapshot_starts_with_declaration_on_one_line() {
        let mut doc = Document::new("s", "pw");
        doc.set_cell("A1", "x");

        let snapshot = doc.render_snapshot();
        assert!(snapshot.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?> <spreadsheet>"));
        assert!(!snapshot.contains('\n'));
    }

    #[test]
    fn snapshot_lists_cells_in_order_with_tag() {
        let mut doc = Document::new("s", "pw");
        doc.set_cell("B1", "2");
        doc.set_cell("A1", "1");
        doc.set_version_tag("7");

        assert_eq!(
            doc.render_snapshot(),
            declared(
                "<spreadsheet version=\"7\"><cell><name>A1</name><contents>1</contents></cell>\
                 <cell><name>B1</name><contents>2</contents></cell></spreadsheet>"
            )
        );
    }

    #[test]
    fn snapshot_escapes_and_collapses_whitespace() {
        let mut doc = Document::new("s", "pw");
        doc.set_cell("A1", "  a <b>\n\n  c & d  ");

        assert_eq!(
            doc.render_snapshot(),
            declared(
                "<spreadsheet><cell><name>A1</name><contents> a &lt;b&gt; c &amp; d \
                 </contents></cell></spreadsheet>"
            )
        );
    }
}
