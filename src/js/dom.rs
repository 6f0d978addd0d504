use kuchiki::traits::*;
use kuchiki::{parse_html, NodeRef};
use thiserror::Error;

pub const EMPTY_DOCUMENT: &str = "<!DOCTYPE html><html><head></head><body></body></html>";

/// Index of a node inside one [`DocumentTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomError {
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("node {0:?} is not an element")]
    NotAnElement(NodeId),
    #[error("cannot create element <{0}>")]
    InvalidTagName(String),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("node {child:?} is not a child of {parent:?}")]
    NotAChild { parent: NodeId, child: NodeId },
}

/// HTML document backing one frame. Nodes are exposed through stable
/// [`NodeId`]s allocated the first time a node is handed out.
pub struct DocumentTree {
    root: NodeRef,
    nodes: Vec<NodeRef>,
}

impl DocumentTree {
    pub fn empty() -> Self {
        Self::parse(EMPTY_DOCUMENT)
    }

    pub fn parse(html: &str) -> Self {
        Self {
            root: parse_html().one(html),
            nodes: Vec::new(),
        }
    }

    pub fn handle_for(&mut self, node: &NodeRef) -> NodeId {
        if let Some(index) = self.nodes.iter().position(|known| known == node) {
            return NodeId(index);
        }
        self.nodes.push(node.clone());
        NodeId(self.nodes.len() - 1)
    }

    /// Whether `node` is this tree's document node.
    pub fn is_root(&self, node: &NodeRef) -> bool {
        *node == self.root
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeRef, DomError> {
        self.nodes.get(id.0).ok_or(DomError::UnknownNode(id))
    }

    fn first(&mut self, selector: &str) -> Option<NodeId> {
        let node = self.root.select_first(selector).ok()?.as_node().clone();
        Some(self.handle_for(&node))
    }

    pub fn document_element(&mut self) -> Option<NodeId> {
        self.first("html")
    }

    pub fn head(&mut self) -> Option<NodeId> {
        self.first("head")
    }

    pub fn body(&mut self) -> Option<NodeId> {
        self.first("body")
    }

    /// Create a detached element. Only tags the HTML parser accepts in a
    /// plain document are supported.
    pub fn create_element(&mut self, tag: &str) -> Result<NodeId, DomError> {
        let tag = tag.trim().to_ascii_lowercase();
        let valid = !tag.is_empty()
            && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !matches!(tag.as_str(), "html" | "head" | "body");
        if !valid {
            return Err(DomError::InvalidTagName(tag));
        }

        let scratch = parse_html().one(format!("<{tag}></{tag}>"));
        let element = scratch
            .select_first(&tag)
            .map_err(|_| DomError::InvalidTagName(tag.clone()))?
            .as_node()
            .clone();
        element.detach();
        Ok(self.handle_for(&element))
    }

    pub fn get_attribute(&self, id: NodeId, name: &str) -> Result<Option<String>, DomError> {
        let node = self.node(id)?;
        let element = node.as_element().ok_or(DomError::NotAnElement(id))?;
        let attributes = element.attributes.borrow();
        Ok(attributes
            .get(name.to_ascii_lowercase().as_str())
            .map(|value| value.to_string()))
    }

    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let node = self.node(id)?;
        let element = node.as_element().ok_or(DomError::NotAnElement(id))?;
        element
            .attributes
            .borrow_mut()
            .insert(name.to_ascii_lowercase().as_str(), value.to_string());
        Ok(())
    }

    pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> Result<(), DomError> {
        let node = self.node(id)?;
        let element = node.as_element().ok_or(DomError::NotAnElement(id))?;
        element
            .attributes
            .borrow_mut()
            .remove(name.to_ascii_lowercase().as_str());
        Ok(())
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let child = self.node(child)?.clone();
        self.node(parent)?.append(child);
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let parent_node = self.node(parent)?;
        let child_node = self.node(child)?;
        if child_node.parent().as_ref() != Some(parent_node) {
            return Err(DomError::NotAChild { parent, child });
        }
        child_node.detach();
        Ok(())
    }

    pub fn parent(&mut self, id: NodeId) -> Result<Option<NodeId>, DomError> {
        let parent = self.node(id)?.parent();
        Ok(parent.map(|node| self.handle_for(&node)))
    }

    pub fn is_connected(&self, id: NodeId) -> Result<bool, DomError> {
        let node = self.node(id)?;
        Ok(node.ancestors().any(|ancestor| ancestor == self.root))
    }

    pub fn element_by_id(&mut self, wanted: &str) -> Option<NodeId> {
        let found = self.root.descendants().find(|node| {
            node.as_element()
                .map(|element| element.attributes.borrow().get("id") == Some(wanted))
                .unwrap_or(false)
        })?;
        Some(self.handle_for(&found))
    }

    pub fn query_all(&mut self, selector: &str) -> Result<Vec<NodeId>, DomError> {
        let matches: Vec<NodeRef> = self
            .root
            .select(selector)
            .map_err(|_| DomError::InvalidSelector(selector.to_string()))?
            .map(|element| element.as_node().clone())
            .collect();
        Ok(matches.iter().map(|node| self.handle_for(node)).collect())
    }

    pub fn tag_name(&self, id: NodeId) -> Result<String, DomError> {
        let node = self.node(id)?;
        let element = node.as_element().ok_or(DomError::NotAnElement(id))?;
        Ok(element.name.local.to_string().to_ascii_uppercase())
    }

    pub fn text_content(&self, id: NodeId) -> Result<String, DomError> {
        Ok(self.node(id)?.text_contents())
    }

    pub fn set_text_content(&mut self, id: NodeId, text: &str) -> Result<(), DomError> {
        let node = self.node(id)?;
        for child in node.children().collect::<Vec<_>>() {
            child.detach();
        }
        if !text.is_empty() {
            node.append(NodeRef::new_text(text));
        }
        Ok(())
    }

    pub fn inner_html(&self, id: NodeId) -> Result<String, DomError> {
        Ok(self
            .node(id)?
            .children()
            .map(|child| child.to_string())
            .collect())
    }

    pub fn to_html(&self) -> String {
        self.root.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_has_head_and_body() {
        let mut tree = DocumentTree::empty();
        assert!(tree.head().is_some());
        assert!(tree.body().is_some());
        assert!(tree.document_element().is_some());
    }

    #[test]
    fn created_elements_attach_and_serialize() {
        let mut tree = DocumentTree::empty();
        let head = tree.head().unwrap();
        let script = tree.create_element("script").unwrap();
        tree.set_attribute(script, "src", "/a.js").unwrap();
        tree.set_attribute(script, "data-uuid", "u-1").unwrap();
        assert!(!tree.is_connected(script).unwrap());

        tree.append_child(head, script).unwrap();
        assert!(tree.is_connected(script).unwrap());
        assert_eq!(tree.parent(script).unwrap(), Some(head));
        assert_eq!(
            tree.get_attribute(script, "data-uuid").unwrap().as_deref(),
            Some("u-1")
        );
        assert_eq!(tree.query_all("script[src=\"/a.js\"]").unwrap(), vec![script]);
        assert!(tree.to_html().contains("data-uuid=\"u-1\""));
    }

    #[test]
    fn handles_are_stable() {
        let mut tree = DocumentTree::parse("<html><body><div id=\"app\">hi</div></body></html>");
        let first = tree.element_by_id("app").unwrap();
        let second = tree.query_all("#app").unwrap()[0];
        assert_eq!(first, second);
        assert_eq!(tree.tag_name(first).unwrap(), "DIV");
        assert_eq!(tree.text_content(first).unwrap(), "hi");
    }

    #[test]
    fn remove_child_checks_parentage() {
        let mut tree = DocumentTree::empty();
        let head = tree.head().unwrap();
        let body = tree.body().unwrap();
        let div = tree.create_element("div").unwrap();
        tree.append_child(body, div).unwrap();
        assert_eq!(
            tree.remove_child(head, div),
            Err(DomError::NotAChild {
                parent: head,
                child: div
            })
        );
        tree.remove_child(body, div).unwrap();
        assert!(!tree.is_connected(div).unwrap());
    }

    #[test]
    fn text_content_replaces_children() {
        let mut tree = DocumentTree::empty();
        let body = tree.body().unwrap();
        let div = tree.create_element("div").unwrap();
        tree.append_child(body, div).unwrap();
        tree.set_text_content(div, "one").unwrap();
        tree.set_text_content(div, "two").unwrap();
        assert_eq!(tree.inner_html(div).unwrap(), "two");
    }

    #[test]
    fn rejects_structural_tags() {
        let mut tree = DocumentTree::empty();
        assert!(matches!(
            tree.create_element("body"),
            Err(DomError::InvalidTagName(_))
        ));
        assert!(matches!(
            tree.create_element("bad tag"),
            Err(DomError::InvalidTagName(_))
        ));
    }
}
