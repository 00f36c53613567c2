use std::sync::Arc;

use crate::cache::view::ResourceView;
use crate::cache::{CacheInner, EventSubscription};
use crate::rid::Rid;
use crate::value::ResourceData;

/// A ref-counted registration onto a cache entry, owned by one client
/// subscription. Dropping the handle (or calling `unsubscribe`) detaches the
/// subscriber; when the last handle of a view goes, the view is dropped and
/// an empty entry unsubscribes its event topic.
pub struct ResourceHandle {
    entry: Arc<EventSubscription>,
    view: Arc<ResourceView>,
    subscriber_id: u64,
    detached: bool,
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("rid", &self.view.rid)
            .field("subscriber_id", &self.subscriber_id)
            .field("detached", &self.detached)
            .finish()
    }
}

impl ResourceHandle {
    pub(crate) fn new(
        entry: Arc<EventSubscription>,
        view: Arc<ResourceView>,
        subscriber_id: u64,
    ) -> Self {
        Self {
            entry,
            view,
            subscriber_id,
            detached: false,
        }
    }

    /// The RID the view was subscribed under (raw query form).
    pub fn rid(&self) -> &Rid {
        &self.view.rid
    }

    /// Snapshot of the current cached model or collection.
    pub fn data(&self) -> Option<ResourceData> {
        self.view.data()
    }

    /// The query the service normalised the view to, if any.
    pub fn normalized_query(&self) -> Option<String> {
        self.view.normalized_query()
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.entry.detach_subscriber(&self.view, self.subscriber_id);
        if let Some(inner) = self.entry.cache.upgrade() {
            CacheInner::finalize(&inner, &self.entry);
        }
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
