//! Pod Security Standards evaluation.
//!
//! An [`Evaluator`] holds a fixed set of [`Check`]s, each tagged with the
//! level it belongs to and the first policy version that enforces it.
//! Evaluating a pod at a [`LevelVersion`] runs every check at or below the
//! requested level whose version is not newer than the requested one.
//! A check may carry several implementations; the newest one that applies
//! is used. A selected check that overrides another removes it from the run.

pub mod baseline;
pub mod restricted;

use std::collections::BTreeSet;
use std::fmt;

use k8s_openapi::api::core::v1::{ContainerPort, PodSpec, SecurityContext};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("evaluator requires at least one check")]
    NoChecks,
    #[error("duplicate check id '{0}'")]
    DuplicateCheck(String),
    #[error("check '{0}' cannot be assigned to the privileged level")]
    PrivilegedCheck(String),
    #[error("check '{0}' has no versioned implementation")]
    NoVersions(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Privileged,
    Baseline,
    Restricted,
}

impl Level {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "privileged" => Some(Level::Privileged),
            "baseline" => Some(Level::Baseline),
            "restricted" => Some(Level::Restricted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Privileged => "privileged",
            Level::Baseline => "baseline",
            Level::Restricted => "restricted",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy version. `Latest` orders after every concrete version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V(u32, u32),
    Latest,
}

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        if s == "latest" {
            return Some(Version::Latest);
        }
        let (major, minor) = s.strip_prefix('v')?.split_once('.')?;
        Some(Version::V(major.parse().ok()?, minor.parse().ok()?))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::V(major, minor) => write!(f, "v{major}.{minor}"),
            Version::Latest => f.write_str("latest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelVersion {
    pub level: Level,
    pub version: Version,
}

impl LevelVersion {
    pub fn restricted_latest() -> Self {
        Self {
            level: Level::Restricted,
            version: Version::Latest,
        }
    }
}

impl fmt::Display for LevelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
    pub forbidden_reason: String,
    pub forbidden_detail: String,
}

impl CheckResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            forbidden_reason: String::new(),
            forbidden_detail: String::new(),
        }
    }

    pub fn forbidden(reason: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            allowed: false,
            forbidden_reason: reason.into(),
            forbidden_detail: detail.into(),
        }
    }
}

pub type CheckFn = fn(&ObjectMeta, &PodSpec) -> CheckResult;

/// One implementation of a check, used from `minimum_version` until the
/// next entry's version.
#[derive(Debug, Clone, Copy)]
pub struct VersionedCheck {
    pub minimum_version: Version,
    pub evaluate: CheckFn,
}

#[derive(Debug, Clone)]
pub struct Check {
    pub id: &'static str,
    pub level: Level,
    pub versions: Vec<VersionedCheck>,
    /// Ids of lower-level checks this one replaces when both apply.
    pub overrides: &'static [&'static str],
}

impl Check {
    fn for_version(&self, version: Version) -> Option<CheckFn> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.minimum_version <= version)
            .map(|v| v.evaluate)
    }
}

/// Every baseline and restricted check.
pub fn default_checks() -> Vec<Check> {
    let mut checks = baseline::checks();
    checks.extend(restricted::checks());
    checks
}

#[derive(Debug)]
pub struct Evaluator {
    checks: Vec<Check>,
}

impl Evaluator {
    pub fn new(mut checks: Vec<Check>) -> Result<Self, PolicyError> {
        if checks.is_empty() {
            return Err(PolicyError::NoChecks);
        }

        let mut seen = BTreeSet::new();
        for check in &mut checks {
            if check.level == Level::Privileged {
                return Err(PolicyError::PrivilegedCheck(check.id.to_string()));
            }
            if check.versions.is_empty() {
                return Err(PolicyError::NoVersions(check.id.to_string()));
            }
            if !seen.insert(check.id) {
                return Err(PolicyError::DuplicateCheck(check.id.to_string()));
            }
            check.versions.sort_by_key(|v| v.minimum_version);
        }

        checks.sort_by_key(|c| c.id);
        Ok(Self { checks })
    }

    pub fn check_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.checks.iter().map(|c| c.id)
    }

    /// Results are ordered by check id. The privileged level has no checks
    /// and always yields an empty list. A check overridden by another
    /// applicable check is skipped.
    pub fn evaluate_pod(
        &self,
        level_version: LevelVersion,
        metadata: &ObjectMeta,
        spec: &PodSpec,
    ) -> Vec<CheckResult> {
        if level_version.level == Level::Privileged {
            return Vec::new();
        }

        let selected: Vec<(&Check, CheckFn)> = self
            .checks
            .iter()
            .filter(|c| c.level <= level_version.level)
            .filter_map(|c| c.for_version(level_version.version).map(|f| (c, f)))
            .collect();
        let overridden: BTreeSet<&str> = selected
            .iter()
            .flat_map(|(c, _)| c.overrides.iter().copied())
            .collect();

        selected
            .into_iter()
            .filter(|(c, _)| !overridden.contains(c.id))
            .map(|(_, evaluate)| evaluate(metadata, spec))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateCheckResult {
    pub allowed: bool,
    pub forbidden_reasons: Vec<String>,
    pub forbidden_details: Vec<String>,
}

impl AggregateCheckResult {
    pub fn forbidden_reason(&self) -> String {
        self.forbidden_reasons.join(", ")
    }

    /// `reason (detail), reason (detail)`; a reason without detail is
    /// rendered bare.
    pub fn forbidden_detail(&self) -> String {
        self.forbidden_reasons
            .iter()
            .zip(&self.forbidden_details)
            .map(|(reason, detail)| {
                if detail.is_empty() {
                    reason.clone()
                } else {
                    format!("{reason} ({detail})")
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn aggregate_check_results(results: &[CheckResult]) -> AggregateCheckResult {
    let mut agg = AggregateCheckResult {
        allowed: true,
        forbidden_reasons: Vec::new(),
        forbidden_details: Vec::new(),
    };
    for result in results.iter().filter(|r| !r.allowed) {
        agg.allowed = false;
        agg.forbidden_reasons.push(result.forbidden_reason.clone());
        agg.forbidden_details.push(result.forbidden_detail.clone());
    }
    agg
}

/// Common view over containers, init containers and ephemeral containers.
pub(crate) struct ContainerView<'a> {
    pub name: &'a str,
    pub security_context: Option<&'a SecurityContext>,
    pub ports: &'a [ContainerPort],
}

pub(crate) fn visit_containers(spec: &PodSpec) -> impl Iterator<Item = ContainerView<'_>> {
    let regular = spec
        .init_containers
        .iter()
        .flatten()
        .chain(&spec.containers)
        .map(|c| ContainerView {
            name: &c.name,
            security_context: c.security_context.as_ref(),
            ports: c.ports.as_deref().unwrap_or_default(),
        });
    let ephemeral = spec.ephemeral_containers.iter().flatten().map(|c| ContainerView {
        name: &c.name,
        security_context: c.security_context.as_ref(),
        ports: c.ports.as_deref().unwrap_or_default(),
    });
    regular.chain(ephemeral)
}

pub(crate) fn is_windows_pod(spec: &PodSpec) -> bool {
    spec.os.as_ref().is_some_and(|os| os.name == "windows")
}

pub(crate) fn quoted(items: &[&str]) -> String {
    items
        .iter()
        .map(|i| format!("{i:?}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `container "a"` / `containers "a", "b"`.
pub(crate) fn containers_phrase(names: &[&str]) -> String {
    let noun = if names.len() == 1 { "container" } else { "containers" };
    format!("{noun} {}", quoted(names))
}

/// Who set a field: the pod, some containers, or both.
pub(crate) fn setters_phrase(pod: bool, names: &[&str]) -> String {
    match (pod, names.is_empty()) {
        (true, true) => "pod".to_string(),
        (true, false) => format!("pod and {}", containers_phrase(names)),
        (false, _) => containers_phrase(names),
    }
}
