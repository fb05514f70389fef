//! Tag parsing and filtering.
//!
//! Tags have the form `[namespace/]label[:annotation]`. Parsing splits on the
//! first `/`; a tag without `/` lives in the `default` namespace. The `system`
//! namespace is reserved for the identity tag the gateway generates for every
//! device (`system/id:<device id>`).

use std::collections::BTreeSet;

use crate::error::{GatewayError, GatewayResult};

/// Namespace implied by a tag without `/`
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace reserved for generated identity tags
pub const SYSTEM_NAMESPACE: &str = "system";

/// A parsed view over a tag string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag<'a> {
    pub namespace: &'a str,
    pub label: &'a str,
    pub annotation: Option<&'a str>,
}

impl<'a> Tag<'a> {
    /// Parse a tag string. Never fails; use [`validate_tag`] to reject
    /// empty components.
    ///
    /// ```
    /// # use synse_core::tags::Tag;
    /// let tag = Tag::parse("vapor/rack:1");
    /// assert_eq!(tag.namespace, "vapor");
    /// assert_eq!(tag.label, "rack");
    /// assert_eq!(tag.annotation, Some("1"));
    /// assert_eq!(Tag::parse("rack").namespace, "default");
    /// ```
    pub fn parse(tag: &'a str) -> Self {
        let (namespace, rest) = match tag.find('/') {
            Some(idx) => (&tag[..idx], &tag[idx + 1..]),
            None => (DEFAULT_NAMESPACE, tag),
        };
        let (label, annotation) = match rest.find(':') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };
        Self {
            namespace,
            label,
            annotation,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.namespace == SYSTEM_NAMESPACE
    }
}

/// Namespace of a tag string
pub fn namespace_of(tag: &str) -> &str {
    Tag::parse(tag).namespace
}

/// Whether a tag belongs to the reserved `system` namespace
pub fn is_identity_tag(tag: &str) -> bool {
    Tag::parse(tag).is_identity()
}

/// The identity tag bound to a device
///
/// ```
/// # use synse_core::tags::identity_tag;
/// assert_eq!(identity_tag("1234"), "system/id:1234");
/// ```
pub fn identity_tag(device_id: &str) -> String {
    format!("{}/id:{}", SYSTEM_NAMESPACE, device_id)
}

/// Canonical form of a tag with the namespace made explicit.
///
/// ```
/// # use synse_core::tags::normalize;
/// assert_eq!(normalize("rack-1"), "default/rack-1");
/// assert_eq!(normalize("vapor/rack-1"), "vapor/rack-1");
/// ```
pub fn normalize(tag: &str) -> String {
    if tag.contains('/') {
        tag.to_string()
    } else {
        format!("{}/{}", DEFAULT_NAMESPACE, tag)
    }
}

/// Reject tags with an empty namespace or label
pub fn validate_tag(tag: &str) -> GatewayResult<()> {
    let parsed = Tag::parse(tag);
    if parsed.namespace.is_empty() {
        return Err(GatewayError::InvalidRequest(format!(
            "Tag has an empty namespace: '{}'",
            tag
        )));
    }
    if parsed.label.is_empty() {
        return Err(GatewayError::InvalidRequest(format!(
            "Tag has an empty label: '{}'",
            tag
        )));
    }
    Ok(())
}

/// Reject namespace filters that are empty or contain `/`
pub fn validate_namespace(namespace: &str) -> GatewayResult<()> {
    if namespace.is_empty() || namespace.contains('/') {
        return Err(GatewayError::InvalidRequest(format!(
            "Invalid tag namespace: '{}'",
            namespace
        )));
    }
    Ok(())
}

/// Filter a tag collection.
///
/// Identity tags are dropped unless `include_identity` is set; when
/// `namespaces` is non-empty only tags in one of those namespaces are kept.
/// The two filters are independent. The result is deduplicated and sorted
/// ascending.
pub fn filter_tags<'a, I>(tags: I, namespaces: &[String], include_identity: bool) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    tags.into_iter()
        .filter(|tag| include_identity || !is_identity_tag(tag))
        .filter(|tag| {
            namespaces.is_empty() || namespaces.iter().any(|ns| ns == namespace_of(tag))
        })
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
