//! Helpers for building e2e test pods that run on the configured node OS.

use k8s_openapi::api::core::v1::{
    Capabilities, PodSecurityContext, SELinuxOptions, SeccompProfile, SecurityContext,
};

use crate::config::{ConfigError, E2eConfig};
use crate::images::{ImageId, ImageRegistry};

/// User ID used for running restricted (non-root) containers.
pub const DEFAULT_NON_ROOT_USER: i64 = 1000;

const WINDOWS: &str = "windows";

pub fn generate_script_cmd(command: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()]
}

/// Restricted pod security context. `run_as_user` is set so the pod passes
/// the runAsNonRoot check; tests that need a specific user override it.
pub fn restricted_pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(DEFAULT_NON_ROOT_USER),
        seccomp_profile: Some(runtime_default_seccomp_profile()),
        ..Default::default()
    }
}

pub fn restricted_container_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(drop_all()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn runtime_default_seccomp_profile() -> SeccompProfile {
    SeccompProfile {
        type_: "RuntimeDefault".to_string(),
        ..Default::default()
    }
}

pub(crate) fn drop_all() -> Vec<String> {
    vec!["ALL".to_string()]
}

/// Node OS aware defaults for test pods.
///
/// Windows nodes get the agnhost image for every request and no security
/// contexts, since the Linux-only fields would be rejected there.
#[derive(Debug, Clone)]
pub struct PodDefaults {
    node_os_distro: Option<String>,
    images: ImageRegistry,
}

impl PodDefaults {
    pub fn new(node_os_distro: Option<String>, images: ImageRegistry) -> Self {
        Self {
            node_os_distro,
            images,
        }
    }

    /// Builds the defaults from config, loading the repo list if one is set.
    pub fn from_config(config: &E2eConfig) -> Result<Self, ConfigError> {
        let images = ImageRegistry::from_repo_list(config.repo_list.as_deref())?;
        Ok(Self::new(config.node_os_distro.clone(), images))
    }

    pub fn images(&self) -> &ImageRegistry {
        &self.images
    }

    pub fn node_os_distro_is(&self, distro: &str) -> bool {
        self.node_os_distro.as_deref() == Some(distro)
    }

    fn is_windows(&self) -> bool {
        self.node_os_distro_is(WINDOWS)
    }

    pub fn default_test_image(&self) -> String {
        self.images.e2e_image(self.default_test_image_id())
    }

    pub fn default_test_image_id(&self) -> ImageId {
        self.test_image_id(ImageId::BusyBox)
    }

    // Windows nodes always get agnhost, whatever was asked for.
    pub fn test_image(&self, id: ImageId) -> String {
        self.images.e2e_image(self.test_image_id(id))
    }

    pub fn test_image_id(&self, id: ImageId) -> ImageId {
        if self.is_windows() {
            return ImageId::Agnhost;
        }
        id
    }

    pub fn generate_pod_security_context(
        &self,
        fs_group: Option<i64>,
        se_linux_options: Option<SELinuxOptions>,
    ) -> Option<PodSecurityContext> {
        if self.is_windows() {
            return None;
        }
        Some(PodSecurityContext {
            fs_group,
            se_linux_options,
            ..Default::default()
        })
    }

    pub fn generate_container_security_context(&self, privileged: bool) -> Option<SecurityContext> {
        if self.is_windows() {
            return None;
        }
        Some(SecurityContext {
            privileged: Some(privileged),
            ..Default::default()
        })
    }

    pub fn linux_label(&self) -> Option<SELinuxOptions> {
        if self.is_windows() {
            return None;
        }
        Some(SELinuxOptions {
            level: Some("s0:c0,c1".to_string()),
            ..Default::default()
        })
    }
}
