//! ImageStream Custom Resource Definition
//!
//! An ImageStream is a namespaced registry of tagged image references. The
//! build controller reads streams to turn symbolic references in a Build into
//! concrete registry pull specs; it never writes them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// ImageStream is the Schema for the imagestreams API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "image.openshift.io",
    version = "v1",
    kind = "ImageStream",
    namespaced,
    status = "ImageStreamStatus",
    shortname = "is",
    printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".status.dockerImageRepository"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamSpec {
    /// Externally supplied repository location, if any
    #[serde(default)]
    pub docker_image_repository: Option<String>,
}

/// Status of an ImageStream
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamStatus {
    /// Repository in the integrated registry that tags of this stream
    /// resolve under; empty until the registry is configured
    #[serde(default)]
    pub docker_image_repository: String,

    /// Event history per tag, most recent first
    #[serde(default)]
    pub tags: Vec<NamedTagEventList>,
}

/// Event history of one tag
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NamedTagEventList {
    /// Tag name
    pub tag: String,
    /// Recorded events, most recent first
    #[serde(default)]
    pub items: Vec<TagEvent>,
}

/// One image recorded under a tag
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagEvent {
    /// Concrete pull spec of the image
    #[serde(default)]
    pub docker_image_reference: String,
    /// Image identifier, typically a sha256 digest
    #[serde(default)]
    pub image: String,
}

/// Tag applied when a reference does not name one.
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Split an `ImageStreamTag` reference name of the form `name:tag`.
///
/// Returns `None` for names without a tag or with empty components; callers
/// treat that as an invalid reference.
pub fn split_image_stream_tag(name: &str) -> Option<(&str, &str)> {
    let (stream, tag) = name.rsplit_once(':')?;
    if stream.is_empty() || tag.is_empty() || stream.contains('/') {
        return None;
    }
    Some((stream, tag))
}

/// Split an `ImageStreamImage` reference name of the form `name@id`.
pub fn split_image_stream_image(name: &str) -> Option<(&str, &str)> {
    let (stream, id) = name.split_once('@')?;
    if stream.is_empty() || id.is_empty() {
        return None;
    }
    Some((stream, id))
}

/// Find the tag event whose image matches `image_id`, allowing a unique
/// digest prefix.
pub fn resolve_image_id<'a>(
    stream: &'a ImageStream,
    image_id: &str,
) -> Result<&'a TagEvent, ImageIdError> {
    let mut matched: Option<&TagEvent> = None;
    static EMPTY: Vec<NamedTagEventList> = Vec::new();
    let tags = stream
        .status
        .as_ref()
        .map(|s| &s.tags)
        .unwrap_or(&EMPTY);
    for history in tags {
        for event in &history.items {
            if event.image == image_id || event.image.starts_with(image_id) {
                match matched {
                    Some(prev) if prev.image != event.image => {
                        return Err(ImageIdError::Ambiguous);
                    }
                    _ => matched = Some(event),
                }
            }
        }
    }
    matched.ok_or(ImageIdError::NotFound)
}

/// Failure modes of [`resolve_image_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageIdError {
    /// No tag event matched the identifier
    NotFound,
    /// The identifier prefix matched more than one image
    Ambiguous,
}

/// Resolve the most recently tagged image for `tag`; an empty tag means
/// `latest`.
pub fn resolve_latest_tagged_image(stream: &ImageStream, tag: &str) -> Option<String> {
    let tag = if tag.is_empty() { DEFAULT_IMAGE_TAG } else { tag };
    stream
        .status
        .as_ref()?
        .tags
        .iter()
        .find(|t| t.tag == tag)?
        .items
        .first()
        .map(|event| event.docker_image_reference.clone())
        .filter(|r| !r.is_empty())
}

/// Parsed form of a docker pull spec: `[registry/][namespace/]name[:tag][@id]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerImageReference {
    pub registry: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
    pub tag: Option<String>,
    pub id: Option<String>,
}

impl DockerImageReference {
    /// Parse a pull spec. The first path component is treated as a registry
    /// when it looks like a host (contains a dot or colon, or is
    /// `localhost`).
    pub fn parse(spec: &str) -> Result<Self, InvalidImageReference> {
        if spec.is_empty() {
            return Err(InvalidImageReference);
        }
        let (rest, id) = match spec.split_once('@') {
            Some((rest, id)) if !id.is_empty() => (rest, Some(id.to_string())),
            Some(_) => return Err(InvalidImageReference),
            None => (spec, None),
        };

        let mut parts: Vec<&str> = rest.split('/').collect();
        let registry = if parts.len() > 1 {
            let first = parts[0];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                Some(parts.remove(0).to_string())
            } else {
                None
            }
        } else {
            None
        };

        let last = parts.pop().ok_or(InvalidImageReference)?;
        let (name, tag) = match last.rsplit_once(':') {
            Some((name, tag)) if !name.is_empty() && !tag.is_empty() => {
                (name.to_string(), Some(tag.to_string()))
            }
            Some(_) => return Err(InvalidImageReference),
            None => (last.to_string(), None),
        };
        if name.is_empty() {
            return Err(InvalidImageReference);
        }

        let namespace = if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        };

        Ok(DockerImageReference {
            registry,
            namespace,
            name,
            tag,
            id,
        })
    }

    /// Exact string form of the reference, with every set component.
    pub fn exact(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DockerImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{}/", registry)?;
        }
        if let Some(namespace) = &self.namespace {
            write!(f, "{}/", namespace)?;
        }
        f.write_str(&self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(id) = &self.id {
            write!(f, "@{}", id)?;
        }
        Ok(())
    }
}

/// Error for pull specs that cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidImageReference;
