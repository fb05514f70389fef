//! Tag index - inverted index from tag to device ids
//!
//! Derived from a device snapshot; never mutated in place. Every device
//! contributes its own identity tag in addition to the tags its plugin
//! reports.

use std::collections::{BTreeMap, BTreeSet};

use synse_core::tags::{self, filter_tags};
use synse_core::Device;

/// Inverted index over a device snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagIndex {
    by_tag: BTreeMap<String, BTreeSet<String>>,
}

impl TagIndex {
    /// Recompute the full index from a device snapshot
    pub fn rebuild<'a, I>(devices: I) -> Self
    where
        I: IntoIterator<Item = &'a Device>,
    {
        let mut by_tag: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for device in devices {
            let id = device.id();
            by_tag
                .entry(tags::identity_tag(id))
                .or_default()
                .insert(id.to_string());
            for tag in &device.info.tags {
                by_tag.entry(tag.clone()).or_default().insert(id.to_string());
            }
        }
        Self { by_tag }
    }

    /// Distinct tags visible under the given filter, sorted ascending
    pub fn query(&self, namespaces: &[String], include_identity_tags: bool) -> Vec<String> {
        filter_tags(
            self.by_tag.keys().map(String::as_str),
            namespaces,
            include_identity_tags,
        )
    }

    /// Devices carrying a tag.
    ///
    /// `rack-1` and `default/rack-1` name the same tag, so both spellings
    /// are looked up.
    pub fn devices(&self, tag: &str) -> BTreeSet<String> {
        let normalized = tags::normalize(tag);
        let mut ids = BTreeSet::new();
        for key in [tag, normalized.as_str(), normalized_suffix(&normalized)] {
            if let Some(found) = self.by_tag.get(key) {
                ids.extend(found.iter().cloned());
            }
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

/// The unqualified spelling of a `default/` tag, or the tag itself
fn normalized_suffix(normalized: &str) -> &str {
    normalized
        .strip_prefix(tags::DEFAULT_NAMESPACE)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(normalized)
}
