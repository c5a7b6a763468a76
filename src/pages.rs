//! Page registrations.
//!
//! Embedders that host navigable documents can register each page so that
//! markers can be attributed to it. The inner window id is the unique key; a
//! page whose first load is the transient "about:blank" document is replaced
//! in place when the real document arrives with the same inner window id.

use serde::ser::{Serialize, SerializeMap, Serializer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageRegistration {
    pub browsing_context_id: u64,
    /// Unique key for this registration.
    pub inner_window_id: u64,
    pub url: String,
    pub embedder_inner_window_id: u64,
    /// Buffer position when the page was unregistered; `None` while live.
    pub unregister_position: Option<u64>,
}

impl PageRegistration {
    pub fn new(
        browsing_context_id: u64,
        inner_window_id: u64,
        url: String,
        embedder_inner_window_id: u64,
    ) -> PageRegistration {
        PageRegistration {
            browsing_context_id,
            inner_window_id,
            url,
            embedder_inner_window_id,
            unregister_position: None,
        }
    }

    /// Same-registration test for duplicate suppression: everything except
    /// the URL and the unregister position has to match.
    pub fn same_identity(&self, other: &PageRegistration) -> bool {
        self.browsing_context_id == other.browsing_context_id
            && self.inner_window_id == other.inner_window_id
            && self.embedder_inner_window_id == other.embedder_inner_window_id
    }

    pub fn notify_unregistered(&mut self, buffer_position: u64) {
        self.unregister_position = Some(buffer_position);
    }
}

impl Serialize for PageRegistration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("browsingContextID", &self.browsing_context_id)?;
        map.serialize_entry("innerWindowID", &self.inner_window_id)?;
        map.serialize_entry("url", &self.url)?;
        map.serialize_entry("embedderInnerWindowID", &self.embedder_inner_window_id)?;
        map.end()
    }
}
