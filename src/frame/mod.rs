mod history;
mod location;

use std::collections::{HashMap, VecDeque};
use std::fmt;

use anyhow::{anyhow, Result};
use rquickjs::{Object, Persistent};
use url::Url;

use crate::js::dom::{DocumentTree, NodeId};
use crate::js::events::{EventTargetRegistry, ListenerMap};

pub use history::{HistoryEntry, HistoryState};
pub use location::LocationState;

/// Key of a realm in the [`FrameArena`]. The host page is [`FrameId::TOP`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    pub const TOP: FrameId = FrameId(0);

    pub fn is_top(self) -> bool {
        self == Self::TOP
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node in some frame's document, rendered to JS as `"<frame>:<node>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub frame: FrameId,
    pub node: NodeId,
}

impl NodeHandle {
    pub fn new(frame: FrameId, node: NodeId) -> Self {
        Self { frame, node }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (frame, node) = raw.split_once(':')?;
        Some(Self {
            frame: FrameId(frame.parse().ok()?),
            node: NodeId(node.parse().ok()?),
        })
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.frame.0, self.node.0)
    }
}

/// Objects the bootstrap created in a frame's realm.
#[derive(Clone)]
pub struct RealmHandles {
    pub window: Persistent<Object<'static>>,
    pub document: Persistent<Object<'static>>,
    pub location: Persistent<Object<'static>>,
    pub history: Persistent<Object<'static>>,
}

/// A `<script src>` that sandboxed code attached to its own document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingScript {
    pub url: String,
    pub script: NodeHandle,
}

pub struct FrameState {
    pub parent: Option<FrameId>,
    pub document: DocumentTree,
    pub location: LocationState,
    pub history: HistoryState,
    pub events: EventTargetRegistry,
    pub document_events: EventTargetRegistry,
    pub listener_map: ListenerMap,
    pub realm: Option<RealmHandles>,
    pub pending_scripts: VecDeque<PendingScript>,
    /// The `<iframe>` in the host document that stands for this frame.
    pub frame_element: Option<NodeHandle>,
}

impl FrameState {
    pub fn new(parent: Option<FrameId>, document: DocumentTree, url: Url) -> Self {
        Self {
            parent,
            document,
            location: LocationState::new(url.clone()),
            history: HistoryState::new(url),
            events: EventTargetRegistry::default(),
            document_events: EventTargetRegistry::default(),
            listener_map: ListenerMap::default(),
            realm: None,
            pending_scripts: VecDeque::new(),
            frame_element: None,
        }
    }

    /// Record a same-document navigation and move the location with it.
    pub fn push_history(&mut self, url: Url, state: Option<String>, replace: bool) {
        if replace {
            self.history.replace(url.clone(), state);
        } else {
            self.history.push(url.clone(), state);
        }
        self.location.set(url);
    }

    pub fn traverse_history(&mut self, delta: i32) -> bool {
        let Some(entry) = self.history.go(delta) else {
            return false;
        };
        let url = entry.url.clone();
        self.location.set(url);
        true
    }
}

/// Owner of every frame. Bindings refer to frames and nodes by key only.
pub struct FrameArena {
    frames: HashMap<FrameId, FrameState>,
    next_id: u32,
}

impl FrameArena {
    pub fn new(top: FrameState) -> Self {
        let mut frames = HashMap::new();
        frames.insert(FrameId::TOP, top);
        Self { frames, next_id: 1 }
    }

    pub fn allocate(&mut self, state: FrameState) -> FrameId {
        let id = FrameId(self.next_id);
        self.next_id += 1;
        self.frames.insert(id, state);
        id
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.frames.contains_key(&id)
    }

    pub fn get(&self, id: FrameId) -> Option<&FrameState> {
        self.frames.get(&id)
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut FrameState> {
        self.frames.get_mut(&id)
    }

    pub fn frame(&self, id: FrameId) -> Result<&FrameState> {
        self.frames.get(&id).ok_or_else(|| anyhow!("frame {id} is gone"))
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Result<&mut FrameState> {
        self.frames
            .get_mut(&id)
            .ok_or_else(|| anyhow!("frame {id} is gone"))
    }

    pub fn remove(&mut self, id: FrameId) -> Option<FrameState> {
        if id.is_top() {
            return None;
        }
        self.frames.remove(&id)
    }

    pub fn parent_of(&self, id: FrameId) -> Option<FrameId> {
        self.frames.get(&id).and_then(|frame| frame.parent)
    }

    pub fn tree(&mut self, id: FrameId) -> Result<&mut DocumentTree> {
        Ok(&mut self.frame_mut(id)?.document)
    }

    pub fn create_element(&mut self, frame: FrameId, tag: &str) -> Result<NodeHandle> {
        let node = self.tree(frame)?.create_element(tag)?;
        Ok(NodeHandle::new(frame, node))
    }

    pub fn get_attribute(&mut self, handle: NodeHandle, name: &str) -> Result<Option<String>> {
        Ok(self.tree(handle.frame)?.get_attribute(handle.node, name)?)
    }

    pub fn set_attribute(&mut self, handle: NodeHandle, name: &str, value: &str) -> Result<()> {
        Ok(self
            .tree(handle.frame)?
            .set_attribute(handle.node, name, value)?)
    }

    pub fn remove_attribute(&mut self, handle: NodeHandle, name: &str) -> Result<()> {
        Ok(self.tree(handle.frame)?.remove_attribute(handle.node, name)?)
    }

    /// Append `child` under `parent`. The nodes may belong to different
    /// frames (a sandbox mounting into the host body); the child keeps the
    /// handle it was created with.
    pub fn append_child(&mut self, parent: NodeHandle, child: NodeHandle) -> Result<()> {
        if parent.frame == child.frame {
            return Ok(self
                .tree(parent.frame)?
                .append_child(parent.node, child.node)?);
        }
        let child_node = self.tree(child.frame)?.node(child.node)?.clone();
        self.tree(parent.frame)?.node(parent.node)?.append(child_node);
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeHandle, child: NodeHandle) -> Result<()> {
        if parent.frame == child.frame {
            return Ok(self
                .tree(parent.frame)?
                .remove_child(parent.node, child.node)?);
        }
        let child_node = self.tree(child.frame)?.node(child.node)?.clone();
        let parent_node = self.tree(parent.frame)?.node(parent.node)?.clone();
        if child_node.parent().as_ref() != Some(&parent_node) {
            return Err(anyhow!("{child} is not a child of {parent}"));
        }
        child_node.detach();
        Ok(())
    }

    /// Parent of a node. A node mounted into another frame's document reports
    /// a parent handle in that frame.
    pub fn parent(&mut self, handle: NodeHandle) -> Result<Option<NodeHandle>> {
        let node = self.tree(handle.frame)?.node(handle.node)?.clone();
        let Some(parent) = node.parent() else {
            return Ok(None);
        };
        let topmost = parent.ancestors().last().unwrap_or_else(|| parent.clone());
        let owner = if self.tree(handle.frame)?.is_root(&topmost) {
            handle.frame
        } else {
            self.frames
                .iter()
                .find(|(_, frame)| frame.document.is_root(&topmost))
                .map(|(id, _)| *id)
                .unwrap_or(handle.frame)
        };
        let node = self.tree(owner)?.handle_for(&parent);
        Ok(Some(NodeHandle::new(owner, node)))
    }

    pub fn tag_name(&mut self, handle: NodeHandle) -> Result<String> {
        Ok(self.tree(handle.frame)?.tag_name(handle.node)?)
    }

    pub fn text_content(&mut self, handle: NodeHandle) -> Result<String> {
        Ok(self.tree(handle.frame)?.text_content(handle.node)?)
    }

    pub fn set_text_content(&mut self, handle: NodeHandle, text: &str) -> Result<()> {
        Ok(self
            .tree(handle.frame)?
            .set_text_content(handle.node, text)?)
    }

    pub fn inner_html(&mut self, handle: NodeHandle) -> Result<String> {
        Ok(self.tree(handle.frame)?.inner_html(handle.node)?)
    }

    /// Whether the node sits under a document root, its own frame's or the
    /// one it was mounted into.
    pub fn is_connected(&mut self, handle: NodeHandle) -> Result<bool> {
        let node = self.tree(handle.frame)?.node(handle.node)?.clone();
        let Some(topmost) = node.ancestors().last() else {
            return Ok(false);
        };
        Ok(self
            .frames
            .values()
            .any(|frame| frame.document.is_root(&topmost)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> FrameArena {
        let url = Url::parse("http://localhost/").unwrap();
        FrameArena::new(FrameState::new(None, DocumentTree::empty(), url))
    }

    #[test]
    fn node_handles_round_trip_through_strings() {
        let handle = NodeHandle::new(FrameId(3), NodeId(12));
        assert_eq!(handle.to_string(), "3:12");
        assert_eq!(NodeHandle::parse("3:12"), Some(handle));
        assert_eq!(NodeHandle::parse("3"), None);
        assert_eq!(NodeHandle::parse("x:1"), None);
    }

    #[test]
    fn top_frame_cannot_be_removed() {
        let mut frames = arena();
        assert!(frames.remove(FrameId::TOP).is_none());
        assert!(frames.contains(FrameId::TOP));
    }

    #[test]
    fn elements_mount_across_frames() {
        let mut frames = arena();
        let url = Url::parse("about:blank").unwrap();
        let child_frame = frames.allocate(FrameState::new(
            Some(FrameId::TOP),
            DocumentTree::empty(),
            url,
        ));
        let host_body = frames.tree(FrameId::TOP).unwrap().body().unwrap();
        let host_body = NodeHandle::new(FrameId::TOP, host_body);
        let div = frames.create_element(child_frame, "div").unwrap();
        assert!(!frames.is_connected(div).unwrap());

        frames.append_child(host_body, div).unwrap();
        assert!(frames.is_connected(div).unwrap());
        assert_eq!(frames.parent(div).unwrap(), Some(host_body));
        assert!(frames
            .tree(FrameId::TOP)
            .unwrap()
            .to_html()
            .contains("<body><div></div></body>"));

        frames.remove_child(host_body, div).unwrap();
        assert_eq!(frames.parent(div).unwrap(), None);
        assert!(!frames.is_connected(div).unwrap());
    }

    #[test]
    fn history_traversal_moves_location() {
        let mut frames = arena();
        let top = frames.frame_mut(FrameId::TOP).unwrap();
        let next = top.location.resolve("/next").unwrap();
        top.push_history(next, Some("1".into()), false);
        assert_eq!(top.location.part("pathname").as_deref(), Some("/next"));
        assert!(top.traverse_history(-1));
        assert_eq!(top.location.part("pathname").as_deref(), Some("/"));
        assert!(!top.traverse_history(-1));
    }
}
