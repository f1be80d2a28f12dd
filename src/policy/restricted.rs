use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;

use super::{
    Check, CheckFn, CheckResult, Level, Version, VersionedCheck, containers_phrase,
    is_windows_pod, quoted, setters_phrase, visit_containers,
};

const ALLOWED_VOLUME_TYPES: [&str; 8] = [
    "configMap",
    "csi",
    "downwardAPI",
    "emptyDir",
    "ephemeral",
    "persistentVolumeClaim",
    "projected",
    "secret",
];

const ALLOWED_ADD_CAPABILITY: &str = "NET_BIND_SERVICE";

const RESTRICTED_SECCOMP_TYPES: [&str; 2] = ["RuntimeDefault", "Localhost"];

/// Version that exempts pods with `spec.os.name=windows` from the Linux-only
/// restricted checks.
const WINDOWS_EXEMPT_SINCE: Version = Version::V(1, 25);

pub fn checks() -> Vec<Check> {
    let check = |id: &'static str,
                 versions: Vec<VersionedCheck>,
                 overrides: &'static [&'static str]| Check {
        id,
        level: Level::Restricted,
        versions,
        overrides,
    };
    vec![
        check(
            "allowPrivilegeEscalation",
            vec![
                since(Version::V(1, 8), allow_privilege_escalation),
                since(WINDOWS_EXEMPT_SINCE, allow_privilege_escalation_windows_exempt),
            ],
            &[],
        ),
        check(
            "capabilities_restricted",
            vec![
                since(Version::V(1, 22), capabilities_restricted),
                since(WINDOWS_EXEMPT_SINCE, capabilities_restricted_windows_exempt),
            ],
            &["capabilities_baseline"],
        ),
        check(
            "restrictedVolumes",
            vec![since(Version::V(1, 0), restricted_volumes)],
            &["hostPathVolumes"],
        ),
        check("runAsNonRoot", vec![since(Version::V(1, 0), run_as_non_root)], &[]),
        check("runAsUser", vec![since(Version::V(1, 23), run_as_user)], &[]),
        check(
            "seccompProfile_restricted",
            vec![
                since(Version::V(1, 19), seccomp_profile_restricted),
                since(WINDOWS_EXEMPT_SINCE, seccomp_profile_restricted_windows_exempt),
            ],
            &["seccompProfile_baseline"],
        ),
    ]
}

fn since(minimum_version: Version, evaluate: CheckFn) -> VersionedCheck {
    VersionedCheck {
        minimum_version,
        evaluate,
    }
}

fn windows_exempt(spec: &PodSpec, check: impl FnOnce() -> CheckResult) -> CheckResult {
    if is_windows_pod(spec) {
        return CheckResult::allowed();
    }
    check()
}

pub fn allow_privilege_escalation_windows_exempt(
    metadata: &ObjectMeta,
    spec: &PodSpec,
) -> CheckResult {
    windows_exempt(spec, || allow_privilege_escalation(metadata, spec))
}

pub fn capabilities_restricted_windows_exempt(
    metadata: &ObjectMeta,
    spec: &PodSpec,
) -> CheckResult {
    windows_exempt(spec, || capabilities_restricted(metadata, spec))
}

pub fn seccomp_profile_restricted_windows_exempt(
    metadata: &ObjectMeta,
    spec: &PodSpec,
) -> CheckResult {
    windows_exempt(spec, || seccomp_profile_restricted(metadata, spec))
}

pub fn allow_privilege_escalation(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let bad_containers: Vec<&str> = visit_containers(spec)
        .filter(|c| c.security_context.and_then(|sc| sc.allow_privilege_escalation) != Some(false))
        .map(|c| c.name)
        .collect();

    if bad_containers.is_empty() {
        return CheckResult::allowed();
    }
    CheckResult::forbidden(
        "allowPrivilegeEscalation != false",
        format!(
            "{} must set securityContext.allowPrivilegeEscalation=false",
            containers_phrase(&bad_containers)
        ),
    )
}

pub fn capabilities_restricted(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let mut missing_drop = Vec::new();
    let mut bad_add = Vec::new();
    let mut bad_capabilities: Vec<&str> = Vec::new();

    for c in visit_containers(spec) {
        let caps = c.security_context.and_then(|sc| sc.capabilities.as_ref());
        let drops_all = caps
            .and_then(|caps| caps.drop.as_deref())
            .unwrap_or_default()
            .iter()
            .any(|cap| cap == "ALL");
        if !drops_all {
            missing_drop.push(c.name);
        }

        let mut container_bad = false;
        for cap in caps.and_then(|caps| caps.add.as_deref()).unwrap_or_default() {
            if cap != ALLOWED_ADD_CAPABILITY {
                container_bad = true;
                if !bad_capabilities.contains(&cap.as_str()) {
                    bad_capabilities.push(cap.as_str());
                }
            }
        }
        if container_bad {
            bad_add.push(c.name);
        }
    }

    let mut details = Vec::new();
    if !missing_drop.is_empty() {
        details.push(format!(
            "{} must set securityContext.capabilities.drop=[\"ALL\"]",
            containers_phrase(&missing_drop)
        ));
    }
    if !bad_add.is_empty() {
        details.push(format!(
            "{} must not include {} in securityContext.capabilities.add",
            containers_phrase(&bad_add),
            quoted(&bad_capabilities)
        ));
    }

    if details.is_empty() {
        CheckResult::allowed()
    } else {
        CheckResult::forbidden("unrestricted capabilities", details.join("; "))
    }
}

pub fn restricted_volumes(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let mut bad_volumes = Vec::new();
    let mut bad_types: Vec<String> = Vec::new();

    for volume in spec.volumes.iter().flatten() {
        // the volume source is whichever field besides `name` is populated
        let Ok(Value::Object(fields)) = serde_json::to_value(volume) else {
            continue;
        };
        let mut volume_bad = false;
        for key in fields.keys().filter(|k| k.as_str() != "name") {
            if !ALLOWED_VOLUME_TYPES.contains(&key.as_str()) {
                volume_bad = true;
                if !bad_types.contains(key) {
                    bad_types.push(key.clone());
                }
            }
        }
        if volume_bad {
            bad_volumes.push(volume.name.as_str());
        }
    }

    if bad_volumes.is_empty() {
        return CheckResult::allowed();
    }
    let noun = if bad_volumes.len() == 1 { "volume" } else { "volumes" };
    let verb = if bad_volumes.len() == 1 { "uses" } else { "use" };
    let types: Vec<&str> = bad_types.iter().map(String::as_str).collect();
    let type_noun = if types.len() == 1 { "type" } else { "types" };
    CheckResult::forbidden(
        "restricted volume types",
        format!(
            "{noun} {} {verb} restricted volume {type_noun} {}",
            quoted(&bad_volumes),
            quoted(&types)
        ),
    )
}

pub fn run_as_non_root(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let pod_value = spec.security_context.as_ref().and_then(|sc| sc.run_as_non_root);
    let pod_explicit_false = pod_value == Some(false);

    let mut explicit_false = Vec::new();
    let mut implicit = Vec::new();
    for c in visit_containers(spec) {
        match c.security_context.and_then(|sc| sc.run_as_non_root) {
            Some(false) => explicit_false.push(c.name),
            None if pod_value != Some(true) => implicit.push(c.name),
            _ => {}
        }
    }

    let mut details = Vec::new();
    if pod_explicit_false || !explicit_false.is_empty() {
        details.push(format!(
            "{} must not set securityContext.runAsNonRoot=false",
            setters_phrase(pod_explicit_false, &explicit_false)
        ));
    }
    if !implicit.is_empty() {
        details.push(format!(
            "pod or {} must set securityContext.runAsNonRoot=true",
            containers_phrase(&implicit)
        ));
    }

    if details.is_empty() {
        CheckResult::allowed()
    } else {
        CheckResult::forbidden("runAsNonRoot != true", details.join("; "))
    }
}

pub fn run_as_user(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let pod_bad = spec.security_context.as_ref().and_then(|sc| sc.run_as_user) == Some(0);
    let bad_containers: Vec<&str> = visit_containers(spec)
        .filter(|c| c.security_context.and_then(|sc| sc.run_as_user) == Some(0))
        .map(|c| c.name)
        .collect();

    if !pod_bad && bad_containers.is_empty() {
        return CheckResult::allowed();
    }
    CheckResult::forbidden(
        "runAsUser=0",
        format!(
            "{} must not set runAsUser=0",
            setters_phrase(pod_bad, &bad_containers)
        ),
    )
}

pub fn seccomp_profile_restricted(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let valid = |ty: &str| RESTRICTED_SECCOMP_TYPES.contains(&ty);

    let pod_type = spec
        .security_context
        .as_ref()
        .and_then(|sc| sc.seccomp_profile.as_ref())
        .map(|p| p.type_.as_str());
    let pod_bad = pod_type.is_some_and(|ty| !valid(ty));
    let pod_valid = pod_type.is_some_and(valid);

    let mut bad_values: Vec<&str> = Vec::new();
    if let Some(ty) = pod_type.filter(|ty| !valid(ty)) {
        bad_values.push(ty);
    }
    let mut bad_containers = Vec::new();
    let mut unset_containers = Vec::new();
    for c in visit_containers(spec) {
        match c
            .security_context
            .and_then(|sc| sc.seccomp_profile.as_ref())
            .map(|p| p.type_.as_str())
        {
            Some(ty) if !valid(ty) => {
                bad_containers.push(c.name);
                if !bad_values.contains(&ty) {
                    bad_values.push(ty);
                }
            }
            None if !pod_valid => unset_containers.push(c.name),
            _ => {}
        }
    }

    let mut details = Vec::new();
    if pod_bad || !bad_containers.is_empty() {
        details.push(format!(
            "{} must not set securityContext.seccompProfile.type to {}",
            setters_phrase(pod_bad, &bad_containers),
            quoted(&bad_values)
        ));
    }
    if !unset_containers.is_empty() {
        details.push(format!(
            "pod or {} must set securityContext.seccompProfile.type to \"RuntimeDefault\" or \"Localhost\"",
            containers_phrase(&unset_containers)
        ));
    }

    if details.is_empty() {
        CheckResult::allowed()
    } else {
        CheckResult::forbidden("seccompProfile", details.join("; "))
    }
}
