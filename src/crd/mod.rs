//! Custom Resource Definitions for the build operator
//!
//! - Build: a single request to produce a container image, reconciled here
//! - BuildConfig: template and scheduling policy owner of Builds
//! - ImageStream: registry of tagged image references, consulted read-only

mod build;
mod build_config;
mod image_stream;

pub use build::{
    Build, BuildOutput, BuildPhase, BuildSource, BuildSpec, BuildStatus, BuildStatusReason,
    BuildStrategy, CustomBuildStrategy, DockerBuildStrategy, GitBuildSource, ImageSource,
    ImageSourcePath, JenkinsPipelineBuildStrategy, SourceBuildStrategy, BUILDER_SERVICE_ACCOUNT,
    BUILD_CONFIG_ANNOTATION, BUILD_CONFIG_LABEL, BUILD_NAME_ANNOTATION, BUILD_NUMBER_ANNOTATION,
    BUILD_POD_NAME_ANNOTATION, BUILD_RUN_POLICY_LABEL,
};
pub use build_config::{BuildConfig, BuildConfigSpec, BuildConfigStatus, BuildRunPolicy};
pub use image_stream::{
    resolve_image_id, resolve_latest_tagged_image, split_image_stream_image,
    split_image_stream_tag, DockerImageReference, ImageIdError, ImageStream, ImageStreamSpec,
    ImageStreamStatus, InvalidImageReference, NamedTagEventList, TagEvent, DEFAULT_IMAGE_TAG,
};
