use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::ConfigError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("image url '{0}' has no registry component")]
    NoRegistry(String),
    #[error("registry '{registry}' of image '{image}' is not a known e2e registry")]
    UnknownRegistry { image: String, registry: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImageId {
    Agnhost,
    AuthenticatedAlpine,
    BusyBox,
    Etcd,
    Httpd,
    HttpdNew,
    InvalidRegistryImage,
    JessieDnsutils,
    Nginx,
    NginxNew,
    NonRoot,
    Pause,
    Perl,
    Redis,
    VolumeNfsServer,
}

impl ImageId {
    pub const ALL: [ImageId; 15] = [
        ImageId::Agnhost,
        ImageId::AuthenticatedAlpine,
        ImageId::BusyBox,
        ImageId::Etcd,
        ImageId::Httpd,
        ImageId::HttpdNew,
        ImageId::InvalidRegistryImage,
        ImageId::JessieDnsutils,
        ImageId::Nginx,
        ImageId::NginxNew,
        ImageId::NonRoot,
        ImageId::Pause,
        ImageId::Perl,
        ImageId::Redis,
        ImageId::VolumeNfsServer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ImageId::Agnhost => "agnhost",
            ImageId::AuthenticatedAlpine => "authenticated-alpine",
            ImageId::BusyBox => "busybox",
            ImageId::Etcd => "etcd",
            ImageId::Httpd => "httpd",
            ImageId::HttpdNew => "httpd-new",
            ImageId::InvalidRegistryImage => "invalid-registry-image",
            ImageId::JessieDnsutils => "jessie-dnsutils",
            ImageId::Nginx => "nginx",
            ImageId::NginxNew => "nginx-new",
            ImageId::NonRoot => "nonroot",
            ImageId::Pause => "pause",
            ImageId::Perl => "perl",
            ImageId::Redis => "redis",
            ImageId::VolumeNfsServer => "volume-nfs-server",
        }
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const GC_REGISTRY: &str = "registry.k8s.io";
const PROMOTER_E2E_REGISTRY: &str = "registry.k8s.io/e2e-test-images";
const BUILD_IMAGE_REGISTRY: &str = "registry.k8s.io/build-image";
const SIG_STORAGE_REGISTRY: &str = "registry.k8s.io/sig-storage";
const DOCKER_LIBRARY_REGISTRY: &str = "docker.io/library";
const PRIVATE_REGISTRY: &str = "gcr.io/k8s-authenticated-test";
const INVALID_REGISTRY: &str = "invalid.registry.k8s.io/invalid";

fn default_gc_registry() -> String {
    GC_REGISTRY.to_string()
}

fn default_promoter_e2e_registry() -> String {
    PROMOTER_E2E_REGISTRY.to_string()
}

fn default_build_image_registry() -> String {
    BUILD_IMAGE_REGISTRY.to_string()
}

fn default_sig_storage_registry() -> String {
    SIG_STORAGE_REGISTRY.to_string()
}

fn default_docker_library_registry() -> String {
    DOCKER_LIBRARY_REGISTRY.to_string()
}

fn default_private_registry() -> String {
    PRIVATE_REGISTRY.to_string()
}

fn default_invalid_registry() -> String {
    INVALID_REGISTRY.to_string()
}

/// Registries the e2e images are pulled from. Keys missing from a repo
/// list file keep their upstream defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryList {
    #[serde(default = "default_gc_registry")]
    pub gc_registry: String,
    #[serde(default = "default_promoter_e2e_registry")]
    pub promoter_e2e_registry: String,
    #[serde(default = "default_build_image_registry")]
    pub build_image_registry: String,
    #[serde(default = "default_sig_storage_registry")]
    pub sig_storage_registry: String,
    #[serde(default = "default_docker_library_registry")]
    pub docker_library_registry: String,
    #[serde(default = "default_private_registry")]
    pub private_registry: String,
    #[serde(default = "default_invalid_registry")]
    pub invalid_registry: String,
}

impl Default for RegistryList {
    fn default() -> Self {
        Self {
            gc_registry: default_gc_registry(),
            promoter_e2e_registry: default_promoter_e2e_registry(),
            build_image_registry: default_build_image_registry(),
            sig_storage_registry: default_sig_storage_registry(),
            docker_library_registry: default_docker_library_registry(),
            private_registry: default_private_registry(),
            invalid_registry: default_invalid_registry(),
        }
    }
}

impl RegistryList {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let data = fs::read_to_string(path).map_err(|e| ConfigError::RepoListRead {
            path: display.clone(),
            source: e,
        })?;
        Self::from_yaml(&data).map_err(|e| ConfigError::RepoListParse {
            path: display,
            source: e,
        })
    }

    pub fn from_yaml(data: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(data)
    }

    /// Pairs of (upstream default, configured value) for every slot.
    fn slots(&self) -> [(&'static str, &str); 7] {
        [
            (PROMOTER_E2E_REGISTRY, &self.promoter_e2e_registry),
            (BUILD_IMAGE_REGISTRY, &self.build_image_registry),
            (SIG_STORAGE_REGISTRY, &self.sig_storage_registry),
            (DOCKER_LIBRARY_REGISTRY, &self.docker_library_registry),
            (PRIVATE_REGISTRY, &self.private_registry),
            (INVALID_REGISTRY, &self.invalid_registry),
            (GC_REGISTRY, &self.gc_registry),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    pub registry: String,
    pub name: String,
    pub version: String,
}

impl ImageConfig {
    fn new(registry: &str, name: &str, version: &str) -> Self {
        Self {
            registry: registry.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}:{}", self.registry, self.name, self.version)
    }
}

/// Lookup table from [`ImageId`] to the concrete image reference.
#[derive(Debug, Clone)]
pub struct ImageRegistry {
    registries: RegistryList,
    configs: BTreeMap<ImageId, ImageConfig>,
}

impl Default for ImageRegistry {
    fn default() -> Self {
        Self::new(RegistryList::default())
    }
}

impl ImageRegistry {
    pub fn new(registries: RegistryList) -> Self {
        let r = &registries;
        let configs = ImageId::ALL
            .iter()
            .map(|&id| {
                let config = match id {
                    ImageId::Agnhost => ImageConfig::new(&r.promoter_e2e_registry, "agnhost", "2.47"),
                    ImageId::AuthenticatedAlpine => {
                        ImageConfig::new(&r.private_registry, "alpine", "3.7")
                    }
                    ImageId::BusyBox => ImageConfig::new(&r.promoter_e2e_registry, "busybox", "1.36.1-1"),
                    ImageId::Etcd => ImageConfig::new(&r.gc_registry, "etcd", "3.5.15-0"),
                    ImageId::Httpd => ImageConfig::new(&r.promoter_e2e_registry, "httpd", "2.4.38-4"),
                    ImageId::HttpdNew => ImageConfig::new(&r.promoter_e2e_registry, "httpd", "2.4.39-4"),
                    ImageId::InvalidRegistryImage => {
                        ImageConfig::new(&r.invalid_registry, "alpine", "3.1")
                    }
                    ImageId::JessieDnsutils => {
                        ImageConfig::new(&r.promoter_e2e_registry, "jessie-dnsutils", "1.7")
                    }
                    ImageId::Nginx => ImageConfig::new(&r.promoter_e2e_registry, "nginx", "1.14-4"),
                    ImageId::NginxNew => ImageConfig::new(&r.promoter_e2e_registry, "nginx", "1.15-4"),
                    ImageId::NonRoot => ImageConfig::new(&r.promoter_e2e_registry, "nonroot", "1.4"),
                    ImageId::Pause => ImageConfig::new(&r.gc_registry, "pause", "3.10"),
                    ImageId::Perl => ImageConfig::new(&r.promoter_e2e_registry, "perl", "5.26"),
                    ImageId::Redis => ImageConfig::new(&r.promoter_e2e_registry, "redis", "5.0.5-3"),
                    ImageId::VolumeNfsServer => {
                        ImageConfig::new(&r.promoter_e2e_registry, "volume/nfs", "1.4")
                    }
                };
                (id, config)
            })
            .collect();

        Self {
            registries,
            configs,
        }
    }

    pub fn from_repo_list(path: Option<&Path>) -> Result<Self, ConfigError> {
        let registries = match path {
            Some(path) => RegistryList::load(path)?,
            None => RegistryList::default(),
        };
        Ok(Self::new(registries))
    }

    pub fn registries(&self) -> &RegistryList {
        &self.registries
    }

    pub fn image_config(&self, id: ImageId) -> &ImageConfig {
        // every ImageId is inserted by `new`
        &self.configs[&id]
    }

    pub fn e2e_image(&self, id: ImageId) -> String {
        self.image_config(id).full_name()
    }

    pub fn e2e_images(&self) -> BTreeMap<ImageId, String> {
        self.configs
            .iter()
            .map(|(id, config)| (*id, config.full_name()))
            .collect()
    }

    /// Moves an image reference that lives in one of the default e2e
    /// registries onto the configured one.
    pub fn replace_registry_in_image_url(&self, image_url: &str) -> Result<String, ImageError> {
        let ImageRef { registry, remainder } = parse_image_ref(image_url);
        if registry.is_empty() {
            return Err(ImageError::NoRegistry(image_url.to_string()));
        }

        // slots are ordered so that nested defaults match before their parents
        for (default, configured) in self.registries.slots() {
            if registry_matches(&registry, default) {
                let replaced = format!("{configured}{}/{remainder}", &registry[default.len()..]);
                debug!(image = %image_url, replaced = %replaced, "rewrote image registry");
                return Ok(replaced);
            }
        }

        Err(ImageError::UnknownRegistry {
            image: image_url.to_string(),
            registry,
        })
    }
}

fn registry_matches(registry: &str, allowed: &str) -> bool {
    if registry == allowed {
        return true;
    }
    if registry.starts_with(allowed) {
        let next_byte = registry.as_bytes().get(allowed.len());
        return matches!(next_byte, Some(b'/'));
    }
    false
}

struct ImageRef {
    registry: String,
    /// Last path segment with tag and digest, e.g. `busybox:1.36.1-1`.
    remainder: String,
}

fn parse_image_ref(image: &str) -> ImageRef {
    let name_end = image.find('@').unwrap_or(image.len());
    let split_at = image[..name_end].rfind('/');

    match split_at {
        Some(pos) => {
            let name_part = &image[..pos];
            ImageRef {
                registry: extract_registry(name_part),
                remainder: image[pos + 1..].to_string(),
            }
        }
        None if image.is_empty() => ImageRef {
            registry: String::new(),
            remainder: String::new(),
        },
        None => ImageRef {
            registry: DOCKER_LIBRARY_REGISTRY.to_string(),
            remainder: image.to_string(),
        },
    }
}

fn extract_registry(name_part: &str) -> String {
    let first = name_part.split('/').next().unwrap_or(name_part);
    let has_explicit_registry = first.contains('.') || first.contains(':') || first == "localhost";

    if has_explicit_registry {
        name_part.to_string()
    } else {
        format!("docker.io/{name_part}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_e2e_images() {
        let registry = ImageRegistry::default();
        assert_eq!(
            registry.e2e_image(ImageId::BusyBox),
            "registry.k8s.io/e2e-test-images/busybox:1.36.1-1"
        );
        assert_eq!(
            registry.e2e_image(ImageId::Agnhost),
            "registry.k8s.io/e2e-test-images/agnhost:2.47"
        );
        assert_eq!(registry.e2e_image(ImageId::Pause), "registry.k8s.io/pause:3.10");
        assert_eq!(registry.e2e_images().len(), ImageId::ALL.len());
    }

    #[test]
    fn test_registry_list_partial_override() {
        let list = RegistryList::from_yaml(
            "promoterE2eRegistry: mirror.example.com/e2e\ngcRegistry: mirror.example.com\n",
        )
        .unwrap();
        assert_eq!(list.promoter_e2e_registry, "mirror.example.com/e2e");
        assert_eq!(list.gc_registry, "mirror.example.com");
        assert_eq!(list.sig_storage_registry, SIG_STORAGE_REGISTRY);

        let registry = ImageRegistry::new(list);
        assert_eq!(
            registry.e2e_image(ImageId::NonRoot),
            "mirror.example.com/e2e/nonroot:1.4"
        );
        assert_eq!(registry.e2e_image(ImageId::Etcd), "mirror.example.com/etcd:3.5.15-0");
    }

    #[test]
    fn test_registry_list_load_missing_file() {
        let err = RegistryList::load(Path::new("/nonexistent/repo-list.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::RepoListRead { .. }));
    }

    #[test]
    fn test_parse_image_ref() {
        let ImageRef { registry, remainder } = parse_image_ref("busybox:1.29");
        assert_eq!(registry, "docker.io/library");
        assert_eq!(remainder, "busybox:1.29");

        let ImageRef { registry, remainder } =
            parse_image_ref("registry.k8s.io/e2e-test-images/agnhost:2.47");
        assert_eq!(registry, "registry.k8s.io/e2e-test-images");
        assert_eq!(remainder, "agnhost:2.47");

        let ImageRef { registry, remainder } = parse_image_ref("myuser/myapp:v2");
        assert_eq!(registry, "docker.io/myuser");
        assert_eq!(remainder, "myapp:v2");

        let ImageRef { registry, remainder } =
            parse_image_ref("localhost:5000/img@sha256:abcdef");
        assert_eq!(registry, "localhost:5000");
        assert_eq!(remainder, "img@sha256:abcdef");
    }

    #[test]
    fn test_registry_matches() {
        assert!(registry_matches("registry.k8s.io/sig-storage", "registry.k8s.io"));
        assert!(registry_matches("registry.k8s.io", "registry.k8s.io"));
        assert!(!registry_matches("registry.k8s.io.evil.com", "registry.k8s.io"));
    }

    #[test]
    fn test_replace_registry_in_image_url() {
        let list = RegistryList {
            promoter_e2e_registry: "mirror.example.com/e2e".to_string(),
            docker_library_registry: "mirror.example.com/library".to_string(),
            gc_registry: "mirror.example.com/k8s".to_string(),
            ..RegistryList::default()
        };
        let registry = ImageRegistry::new(list);

        assert_eq!(
            registry
                .replace_registry_in_image_url("registry.k8s.io/e2e-test-images/agnhost:2.47")
                .unwrap(),
            "mirror.example.com/e2e/agnhost:2.47"
        );
        assert_eq!(
            registry.replace_registry_in_image_url("busybox:1.29").unwrap(),
            "mirror.example.com/library/busybox:1.29"
        );
        assert_eq!(
            registry
                .replace_registry_in_image_url("registry.k8s.io/etcd:3.5.15-0")
                .unwrap(),
            "mirror.example.com/k8s/etcd:3.5.15-0"
        );
        assert_eq!(
            registry
                .replace_registry_in_image_url("registry.k8s.io/e2e-test-images/volume/nfs:1.4")
                .unwrap(),
            "mirror.example.com/e2e/volume/nfs:1.4"
        );
    }

    #[test]
    fn test_replace_registry_unknown() {
        let registry = ImageRegistry::default();
        assert_eq!(
            registry.replace_registry_in_image_url("quay.io/coreos/etcd:v3"),
            Err(ImageError::UnknownRegistry {
                image: "quay.io/coreos/etcd:v3".to_string(),
                registry: "quay.io/coreos".to_string(),
            })
        );
        assert_eq!(
            registry.replace_registry_in_image_url(""),
            Err(ImageError::NoRegistry(String::new()))
        );
    }
}
