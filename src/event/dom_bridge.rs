//! # DOM Bridge
//!
//! Bridges native UI events into bus events. The UI side is modelled as a
//! headless [`Document`]: a tree of [`Element`]s with native listeners and
//! bubbling dispatch. Rendering is not part of this crate; a renderer drives
//! the document by calling [`Document::dispatch`].
//!
//! A bridge is attached either directly to an element or delegated: a single
//! listener on a root element that fires for any descendant matching a CSS
//! selector, including elements created after the bridge was attached.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    event_bus::{invoke_isolated, Detach, Event, EventBus, EventError, EventResult, Handler, Payload},
    event_type::EventType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub id: ElementId,
    pub tag: String,
    pub dom_id: Option<String>,
    pub classes: Vec<String>,
    pub parent: Option<ElementId>,
}

/// A native event as seen by a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomEvent {
    pub dom_event: String,
    /// Element the event was dispatched on.
    pub target: ElementId,
    /// Element the bridge matched: the listening element for direct bridges,
    /// the selector match for delegated ones.
    pub current_target: ElementId,
    pub detail: Payload,
}

type NativeCallback = Arc<dyn Fn(&DomEvent) + Send + Sync>;

struct NativeListener {
    id: u64,
    element: ElementId,
    dom_event: String,
    callback: NativeCallback,
}

/// Headless element tree with native listeners.
pub struct Document {
    elements: RwLock<HashMap<ElementId, Element>>,
    listeners: Mutex<Vec<NativeListener>>,
    next_element: AtomicU64,
    next_listener: AtomicU64,
    root: ElementId,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let root = ElementId(0);
        let mut elements = HashMap::new();
        elements.insert(
            root,
            Element {
                id: root,
                tag: "body".to_string(),
                dom_id: None,
                classes: Vec::new(),
                parent: None,
            },
        );
        Self {
            elements: RwLock::new(elements),
            listeners: Mutex::new(Vec::new()),
            next_element: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            root,
        }
    }

    pub fn root(&self) -> ElementId {
        self.root
    }

    pub fn create_element(
        &self,
        parent: ElementId,
        tag: &str,
        dom_id: Option<&str>,
        classes: &[&str],
    ) -> EventResult<ElementId> {
        let mut elements = self.elements.write();
        if !elements.contains_key(&parent) {
            return Err(EventError::ElementNotFound(parent.to_string()));
        }
        let id = ElementId(self.next_element.fetch_add(1, Ordering::Relaxed));
        elements.insert(
            id,
            Element {
                id,
                tag: tag.to_ascii_lowercase(),
                dom_id: dom_id.map(str::to_string),
                classes: classes.iter().map(|c| c.to_string()).collect(),
                parent: Some(parent),
            },
        );
        Ok(id)
    }

    /// Removes `id` and its subtree together with their native listeners.
    pub fn remove_element(&self, id: ElementId) -> EventResult<()> {
        if id == self.root {
            return Err(EventError::ElementNotFound(
                "the root element cannot be removed".to_string(),
            ));
        }
        let removed = {
            let mut elements = self.elements.write();
            if !elements.contains_key(&id) {
                return Err(EventError::ElementNotFound(id.to_string()));
            }
            let mut doomed = vec![id];
            let mut cursor = 0;
            while cursor < doomed.len() {
                let current = doomed[cursor];
                doomed.extend(
                    elements
                        .values()
                        .filter(|element| element.parent == Some(current))
                        .map(|element| element.id),
                );
                cursor += 1;
            }
            for element in &doomed {
                elements.remove(element);
            }
            doomed
        };
        self.listeners
            .lock()
            .retain(|listener| !removed.contains(&listener.element));
        Ok(())
    }

    pub fn element(&self, id: ElementId) -> Option<Element> {
        self.elements.read().get(&id).cloned()
    }

    pub fn find_by_dom_id(&self, dom_id: &str) -> Option<ElementId> {
        self.elements
            .read()
            .values()
            .find(|element| element.dom_id.as_deref() == Some(dom_id))
            .map(|element| element.id)
    }

    /// Registers a native listener and returns its id.
    pub fn add_listener<F>(&self, element: ElementId, dom_event: &str, callback: F) -> EventResult<u64>
    where
        F: Fn(&DomEvent) + Send + Sync + 'static,
    {
        if !self.elements.read().contains_key(&element) {
            return Err(EventError::ElementNotFound(element.to_string()));
        }
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(NativeListener {
            id,
            element,
            dom_event: dom_event.to_string(),
            callback: Arc::new(callback),
        });
        Ok(id)
    }

    pub fn remove_listener(&self, listener_id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != listener_id);
        before != listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Dispatches `dom_event` on `target` and bubbles it up to the root.
    ///
    /// Returns the number of native listeners invoked.
    pub fn dispatch(&self, target: ElementId, dom_event: &str, detail: Payload) -> EventResult<usize> {
        let path = self.ancestry(target)?;
        let mut invoked = 0;
        for current in path {
            let callbacks: Vec<NativeCallback> = self
                .listeners
                .lock()
                .iter()
                .filter(|listener| listener.element == current && listener.dom_event == dom_event)
                .map(|listener| listener.callback.clone())
                .collect();
            let event = DomEvent {
                dom_event: dom_event.to_string(),
                target,
                current_target: current,
                detail: detail.clone(),
            };
            for callback in callbacks {
                callback(&event);
                invoked += 1;
            }
        }
        Ok(invoked)
    }

    /// `target` followed by each of its ancestors up to the root.
    fn ancestry(&self, target: ElementId) -> EventResult<Vec<ElementId>> {
        let elements = self.elements.read();
        let mut path = Vec::new();
        let mut cursor = Some(target);
        while let Some(id) = cursor {
            let element = elements
                .get(&id)
                .ok_or_else(|| EventError::ElementNotFound(id.to_string()))?;
            path.push(id);
            cursor = element.parent;
        }
        Ok(path)
    }

    /// Nearest element from `target` up to and including `root` that matches
    /// `selector`.
    fn closest(&self, target: ElementId, root: ElementId, selector: &Selector) -> Option<ElementId> {
        let elements = self.elements.read();
        let mut cursor = Some(target);
        while let Some(id) = cursor {
            let element = elements.get(&id)?;
            if selector.matches(element) {
                return Some(id);
            }
            if id == root {
                return None;
            }
            cursor = element.parent;
        }
        None
    }
}

/// Compound simple selector: `tag`, `#id`, `.class` and combinations such as
/// `button.primary#save`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selector {
    tag: Option<String>,
    dom_id: Option<String>,
    classes: Vec<String>,
}

impl Selector {
    pub fn parse(selector: &str) -> EventResult<Self> {
        let invalid = |message: &str| EventError::InvalidSelector {
            selector: selector.to_string(),
            message: message.to_string(),
        };
        let trimmed = selector.trim();
        if trimmed.is_empty() {
            return Err(invalid("selector is empty"));
        }
        if trimmed.contains(char::is_whitespace) {
            return Err(invalid("combinators are not supported"));
        }

        let mut parsed = Selector::default();
        let mut rest = trimmed;
        let tag_end = rest.find(['#', '.']).unwrap_or(rest.len());
        if tag_end > 0 {
            parsed.tag = Some(rest[..tag_end].to_ascii_lowercase());
        }
        rest = &rest[tag_end..];

        while let Some(marker) = rest.chars().next() {
            let body = &rest[1..];
            let end = body.find(['#', '.']).unwrap_or(body.len());
            let name = &body[..end];
            if name.is_empty() {
                return Err(invalid("empty id or class name"));
            }
            match marker {
                '#' if parsed.dom_id.is_some() => return Err(invalid("more than one id")),
                '#' => parsed.dom_id = Some(name.to_string()),
                _ => parsed.classes.push(name.to_string()),
            }
            rest = &body[end..];
        }
        Ok(parsed)
    }

    pub fn matches(&self, element: &Element) -> bool {
        self.tag.as_ref().map_or(true, |tag| *tag == element.tag)
            && self
                .dom_id
                .as_ref()
                .map_or(true, |id| element.dom_id.as_ref() == Some(id))
            && self
                .classes
                .iter()
                .all(|class| element.classes.contains(class))
    }
}

/// Where a DOM bridge listens.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeTarget {
    Element(ElementId),
    Delegated { root: ElementId, selector: String },
}

impl EventBus {
    /// Attaches a native listener that emits `bus_event` on this bus and then
    /// invokes `handler` with the same event.
    ///
    /// The returned [`Detach`] removes only this bridge.
    pub fn on_dom(
        self: &Arc<Self>,
        document: &Arc<Document>,
        target: BridgeTarget,
        dom_event: &str,
        bus_event: EventType,
        handler: Handler,
    ) -> EventResult<Detach> {
        let bus = Arc::downgrade(self);
        let listener_id = match target {
            BridgeTarget::Element(element) => document.add_listener(element, dom_event, move |native| {
                forward(&bus, &bus_event, &handler, native)
            })?,
            BridgeTarget::Delegated { root, selector } => {
                let selector = Selector::parse(&selector)?;
                let doc = Arc::downgrade(document);
                document.add_listener(root, dom_event, move |native| {
                    let Some(doc) = doc.upgrade() else {
                        return;
                    };
                    if let Some(matched) = doc.closest(native.target, root, &selector) {
                        let delegated = DomEvent {
                            current_target: matched,
                            ..native.clone()
                        };
                        forward(&bus, &bus_event, &handler, &delegated);
                    }
                })?
            }
        };
        debug!(listener_id, dom_event, "DOM bridge attached");

        let document: Weak<Document> = Arc::downgrade(document);
        Ok(Detach::new(move || {
            if let Some(document) = document.upgrade() {
                document.remove_listener(listener_id);
            }
        }))
    }
}

fn forward(bus: &Weak<EventBus>, bus_event: &EventType, handler: &Handler, native: &DomEvent) {
    let payload = match serde_json::to_value(native) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!("Failed to encode DOM event: {}", err);
            return;
        }
    };
    let event = Event::new(bus_event.clone(), payload);
    if let Some(bus) = bus.upgrade() {
        bus.emit(event.clone());
    }
    invoke_isolated(handler, &event);
}
