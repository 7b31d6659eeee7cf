//! Image reference resolution
//!
//! Builds may name their inputs and output symbolically, as image stream
//! tags or image stream images. Before an executor pod is created every such
//! reference is rewritten to a concrete registry pull spec using the cached
//! image streams. References that cannot be resolved yet register the build
//! in the [`TriggerIndex`], so the image stream watch wakes it when the
//! stream appears or changes.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::ResourceExt;
use thiserror::Error;

use crate::clients::{resource_key, ImageStreamLister};
use crate::crd::{
    resolve_image_id, resolve_latest_tagged_image, split_image_stream_image,
    split_image_stream_tag, Build, BuildStatusReason, DockerImageReference, ImageIdError,
    DEFAULT_IMAGE_TAG,
};
use crate::triggers::TriggerIndex;
use crate::update::BuildUpdate;

/// Reference kinds the resolver understands.
const KIND_IMAGE_STREAM: &str = "ImageStream";
const KIND_IMAGE_STREAM_TAG: &str = "ImageStreamTag";
const KIND_IMAGE_STREAM_IMAGE: &str = "ImageStreamImage";
const KIND_DOCKER_IMAGE: &str = "DockerImage";

/// Failures while resolving image references.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// One or more references had names that do not parse
    #[error("one or more image references were invalid")]
    InvalidImageReference,

    /// The output stream exists but the integrated registry has not
    /// populated its repository yet
    #[error("the integrated registry is not configured")]
    NoIntegratedRegistry,

    /// The referenced stream is not in the cache; an ImageStream event will
    /// wake the build
    #[error("image stream {namespace}/{name} does not exist")]
    StreamNotFound { namespace: String, name: String },

    /// The stream exists but the requested tag has no image
    #[error("image stream tag {namespace}/{name} does not exist")]
    TagNotFound { namespace: String, name: String },

    /// The stream exists but no tag event matches the requested image id
    #[error("image stream image {namespace}/{name} could not be resolved")]
    ImageNotFound { namespace: String, name: String },

    /// A matched tag event has no pull spec recorded
    #[error("image stream image {namespace}/{name} does not have a pull spec")]
    MissingPullSpec { namespace: String, name: String },
}

impl ResolveError {
    /// True when the build should park in `New` and wait for an ImageStream
    /// event instead of retrying through the queue. Both cases clear up only
    /// when the stream changes, and the build is already registered in the
    /// trigger index by then.
    pub fn awaits_stream_event(&self) -> bool {
        matches!(
            self,
            ResolveError::StreamNotFound { .. } | ResolveError::NoIntegratedRegistry
        )
    }
}

/// Visit every image reference in a build: strategy inputs, source image
/// inputs, and the output target. The closure's errors are collected rather
/// than aborting the walk.
pub fn visit_image_references<F>(build: &mut Build, mut visit: F) -> Vec<ResolveError>
where
    F: FnMut(&mut ObjectReference) -> Result<(), ResolveError>,
{
    let mut errors = Vec::new();
    {
        let mut record = |result: Result<(), ResolveError>| {
            if let Err(err) = result {
                errors.push(err);
            }
        };

        let strategy = &mut build.spec.strategy;
        if let Some(docker) = strategy.docker_strategy.as_mut() {
            if let Some(from) = docker.from.as_mut() {
                record(visit(from));
            }
        }
        if let Some(source) = strategy.source_strategy.as_mut() {
            record(visit(&mut source.from));
        }
        if let Some(custom) = strategy.custom_strategy.as_mut() {
            record(visit(&mut custom.from));
        }
        for image in build.spec.source.images.iter_mut() {
            record(visit(&mut image.from));
        }
        if let Some(to) = build.spec.output.to.as_mut() {
            record(visit(to));
        }
    }
    errors
}

/// Namespace of a reference, defaulting to the build's own.
fn reference_namespace<'a>(reference: &'a ObjectReference, default_namespace: &'a str) -> &'a str {
    reference
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(default_namespace)
}

/// Collect the `namespace/name` keys of every image stream a build still
/// refers to symbolically. Malformed names fail the whole collection.
pub fn unresolved_stream_references(
    build: &mut Build,
    default_namespace: &str,
) -> Result<Vec<String>, ResolveError> {
    let mut streams = Vec::new();
    let errors = visit_image_references(build, |reference| {
        let name = reference.name.as_deref().unwrap_or_default();
        match reference.kind.as_deref() {
            Some(KIND_IMAGE_STREAM_TAG) => {
                let (stream, _) =
                    split_image_stream_tag(name).ok_or(ResolveError::InvalidImageReference)?;
                let namespace = reference_namespace(reference, default_namespace);
                streams.push(resource_key(namespace, stream));
                Ok(())
            }
            Some(KIND_IMAGE_STREAM_IMAGE) => {
                let (stream, _) =
                    split_image_stream_image(name).ok_or(ResolveError::InvalidImageReference)?;
                let namespace = reference_namespace(reference, default_namespace);
                streams.push(resource_key(namespace, stream));
                Ok(())
            }
            Some(KIND_IMAGE_STREAM) => {
                if name.is_empty() {
                    return Err(ResolveError::InvalidImageReference);
                }
                let namespace = reference_namespace(reference, default_namespace);
                streams.push(resource_key(namespace, name));
                Ok(())
            }
            _ => Ok(()),
        }
    });
    if !errors.is_empty() {
        return Err(ResolveError::InvalidImageReference);
    }
    Ok(streams)
}

/// Resolve an output reference to a location in the integrated registry.
pub fn resolve_image_stream_location(
    reference: &ObjectReference,
    streams: &dyn ImageStreamLister,
    default_namespace: &str,
) -> Result<String, ResolveError> {
    let namespace = reference_namespace(reference, default_namespace);
    let raw_name = reference.name.as_deref().unwrap_or_default();

    let (name, tag) = match reference.kind.as_deref() {
        Some(KIND_IMAGE_STREAM_IMAGE) => {
            // Stream-image outputs resolve to the latest tag.
            let (name, _) =
                split_image_stream_image(raw_name).ok_or(ResolveError::InvalidImageReference)?;
            (name, DEFAULT_IMAGE_TAG.to_string())
        }
        Some(KIND_IMAGE_STREAM_TAG) => {
            let (name, tag) =
                split_image_stream_tag(raw_name).ok_or(ResolveError::InvalidImageReference)?;
            (name, tag.to_string())
        }
        _ => (raw_name, String::new()),
    };

    let stream = streams
        .get_image_stream(namespace, name)
        .ok_or_else(|| ResolveError::StreamNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;

    let repository = stream
        .status
        .as_ref()
        .map(|s| s.docker_image_repository.as_str())
        .unwrap_or_default();
    if repository.is_empty() {
        return Err(ResolveError::NoIntegratedRegistry);
    }

    let mut repo = DockerImageReference::parse(repository)
        .map_err(|_| ResolveError::InvalidImageReference)?;
    repo.id = None;
    repo.tag = if tag.is_empty() { None } else { Some(tag) };
    Ok(repo.exact())
}

/// Resolve an `ImageStreamImage` input to a concrete `DockerImage` reference.
pub fn resolve_image_stream_image(
    reference: &ObjectReference,
    streams: &dyn ImageStreamLister,
    default_namespace: &str,
) -> Result<ObjectReference, ResolveError> {
    let namespace = reference_namespace(reference, default_namespace);
    let raw_name = reference.name.as_deref().unwrap_or_default();
    let (name, image_id) =
        split_image_stream_image(raw_name).ok_or(ResolveError::InvalidImageReference)?;

    let stream = streams
        .get_image_stream(namespace, name)
        .ok_or_else(|| ResolveError::StreamNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;

    let event = resolve_image_id(&stream, image_id).map_err(|err| match err {
        ImageIdError::NotFound | ImageIdError::Ambiguous => ResolveError::ImageNotFound {
            namespace: namespace.to_string(),
            name: raw_name.to_string(),
        },
    })?;
    if event.docker_image_reference.is_empty() {
        return Err(ResolveError::MissingPullSpec {
            namespace: namespace.to_string(),
            name: raw_name.to_string(),
        });
    }
    Ok(docker_image_reference(&event.docker_image_reference))
}

/// Resolve an `ImageStreamTag` input to the latest image under the tag.
pub fn resolve_image_stream_tag(
    reference: &ObjectReference,
    streams: &dyn ImageStreamLister,
    default_namespace: &str,
) -> Result<ObjectReference, ResolveError> {
    let namespace = reference_namespace(reference, default_namespace);
    let raw_name = reference.name.as_deref().unwrap_or_default();
    let (name, tag) =
        split_image_stream_tag(raw_name).ok_or(ResolveError::InvalidImageReference)?;

    let stream = streams
        .get_image_stream(namespace, name)
        .ok_or_else(|| ResolveError::StreamNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;

    match resolve_latest_tagged_image(&stream, tag) {
        Some(pull_spec) => Ok(docker_image_reference(&pull_spec)),
        None => Err(ResolveError::TagNotFound {
            namespace: namespace.to_string(),
            name: raw_name.to_string(),
        }),
    }
}

fn docker_image_reference(pull_spec: &str) -> ObjectReference {
    ObjectReference {
        kind: Some(KIND_DOCKER_IMAGE.to_string()),
        name: Some(pull_spec.to_string()),
        ..Default::default()
    }
}

/// Resolves all symbolic references inside a build against the image stream
/// cache and keeps the trigger index in step.
pub struct ImageResolver {
    streams: Arc<dyn ImageStreamLister>,
    triggers: Arc<TriggerIndex>,
}

impl ImageResolver {
    pub fn new(streams: Arc<dyn ImageStreamLister>, triggers: Arc<TriggerIndex>) -> Self {
        Self { streams, triggers }
    }

    /// Rewrite the build's output reference to a concrete registry location.
    fn resolve_output(&self, build: &mut Build) -> Result<(), ResolveError> {
        let namespace = build.namespace().unwrap_or_default();
        let Some(to) = build.spec.output.to.as_mut() else {
            return Ok(());
        };
        if to.name.as_deref().unwrap_or_default().is_empty() {
            return Ok(());
        }
        match to.kind.as_deref() {
            Some(KIND_IMAGE_STREAM) | Some(KIND_IMAGE_STREAM_TAG) => {
                let location =
                    resolve_image_stream_location(to, self.streams.as_ref(), &namespace)?;
                *to = docker_image_reference(&location);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Resolve every reference in `build` in place. On failure the update is
    /// stamped with the matching reason and the build stays registered in
    /// the trigger index; on success the registration is dropped so stream
    /// events no longer wake the build.
    pub fn resolve(
        &self,
        build: &mut Build,
        update: &mut BuildUpdate,
    ) -> Result<(), ResolveError> {
        let namespace = build.namespace().unwrap_or_default();
        let build_key = resource_key(&namespace, &build.name_any());

        let streams = unresolved_stream_references(build, &namespace)?;
        if streams.is_empty() {
            return Ok(());
        }

        // Register interest before reading the cache: resolution is level
        // driven, and an update racing the read must still wake the build.
        self.triggers.add(&build_key, &streams);

        if let Err(err) = self.resolve_output(build) {
            update.set_reason(BuildStatusReason::InvalidOutputReference);
            update.set_message(BuildStatusReason::InvalidOutputReference.default_message());
            return Err(err);
        }

        let lister = self.streams.as_ref();
        let errors = visit_image_references(build, |reference| {
            match reference.kind.as_deref() {
                Some(KIND_IMAGE_STREAM_IMAGE) => {
                    *reference = resolve_image_stream_image(reference, lister, &namespace)?;
                }
                Some(KIND_IMAGE_STREAM_TAG) => {
                    *reference = resolve_image_stream_tag(reference, lister, &namespace)?;
                }
                _ => {}
            }
            Ok(())
        });
        if let Some(first) = errors.into_iter().next() {
            update.set_reason(BuildStatusReason::InvalidImageReference);
            update.set_message(BuildStatusReason::InvalidImageReference.default_message());
            return Err(first);
        }

        // Fully resolved; no further stream notifications are needed.
        self.triggers.remove(&build_key, &streams);
        Ok(())
    }
}
