//! Pod construction helpers for Kubernetes end-to-end tests.
//!
//! [`pod::PodDefaults`] picks images and security contexts for the node OS
//! under test, and [`mixin::mixin_restricted_pod_security`] makes a pod
//! pass the restricted Pod Security level, checked by a [`policy::Evaluator`].

pub mod config;
pub mod images;
pub mod logging;
pub mod mixin;
pub mod pod;
pub mod policy;

pub use config::{ConfigError, E2eConfig};
pub use images::{ImageError, ImageId, ImageRegistry, RegistryList};
pub use mixin::{MixinError, mixin_restricted_pod_security, must_mixin_restricted_pod_security};
pub use pod::{
    DEFAULT_NON_ROOT_USER, PodDefaults, generate_script_cmd, restricted_container_security_context,
    restricted_pod_security_context,
};
pub use policy::{Evaluator, PolicyError, default_checks};
