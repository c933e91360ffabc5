// Change-event bus
//
// Observers are plain callbacks on an explicit list; events are emitted once
// per committed operation, after the database flush for that operation.

use std::cell::RefCell;
use serde::{Deserialize, Serialize};

/// A reference to one changed resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRef {
    pub id: String,
    pub collection_id: Option<String>,
}

impl ResourceRef {
    pub fn new(id: impl Into<String>, collection_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            collection_id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub created: Vec<ResourceRef>,
    pub updated: Vec<ResourceRef>,
    pub deleted: Vec<ResourceRef>,
}

impl ChangeSet {
    pub fn created(refs: Vec<ResourceRef>) -> Self {
        Self {
            created: refs,
            ..Default::default()
        }
    }

    pub fn updated(refs: Vec<ResourceRef>) -> Self {
        Self {
            updated: refs,
            ..Default::default()
        }
    }

    pub fn deleted(refs: Vec<ResourceRef>) -> Self {
        Self {
            deleted: refs,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Ingest session progress, ordered: READ_METADATA status, per-record status,
/// READ_FILES with monotone files_read, then COMPLETED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestStatus {
    pub session_id: String,
    pub phase: String,
    pub total_files: u64,
    pub files_read: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeEvent {
    Collections(ChangeSet),
    Assets(ChangeSet),
    Media(ChangeSet),
    Ingest(IngestStatus),
}

type Observer = Box<dyn Fn(&ChangeEvent)>;

#[derive(Default)]
pub struct EventBus {
    observers: RefCell<Vec<Observer>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: impl Fn(&ChangeEvent) + 'static) {
        self.observers.borrow_mut().push(Box::new(observer));
    }

    pub fn emit(&self, event: &ChangeEvent) {
        // Observers must not subscribe re-entrantly
        for observer in self.observers.borrow().iter() {
            observer(event);
        }
    }

    pub fn emit_collections(&self, change: ChangeSet) {
        if !change.is_empty() {
            self.emit(&ChangeEvent::Collections(change));
        }
    }

    pub fn emit_assets(&self, change: ChangeSet) {
        if !change.is_empty() {
            self.emit(&ChangeEvent::Assets(change));
        }
    }

    pub fn emit_media(&self, change: ChangeSet) {
        if !change.is_empty() {
            self.emit(&ChangeEvent::Media(change));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_emit_reaches_all_observers() {
        let bus = EventBus::new();
        let count = Rc::new(Cell::new(0));

        for _ in 0..3 {
            let count = Rc::clone(&count);
            bus.subscribe(move |_| count.set(count.get() + 1));
        }

        bus.emit_assets(ChangeSet::created(vec![ResourceRef::new("a", None)]));
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_empty_changeset_not_emitted() {
        let bus = EventBus::new();
        let count = Rc::new(Cell::new(0));
        let observed = Rc::clone(&count);
        bus.subscribe(move |_| observed.set(observed.get() + 1));

        bus.emit_assets(ChangeSet::default());
        assert_eq!(count.get(), 0);
    }
}
