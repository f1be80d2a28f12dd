use k8s_openapi::api::core::v1::{PodSpec, SELinuxOptions};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{
    Check, CheckFn, CheckResult, Level, Version, VersionedCheck, containers_phrase, quoted,
    setters_phrase, visit_containers,
};

const APPARMOR_ANNOTATION_PREFIX: &str = "container.apparmor.security.beta.kubernetes.io/";

const DEFAULT_CAPABILITIES: [&str; 13] = [
    "AUDIT_WRITE",
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "FSETID",
    "KILL",
    "MKNOD",
    "NET_BIND_SERVICE",
    "SETFCAP",
    "SETGID",
    "SETPCAP",
    "SETUID",
    "SYS_CHROOT",
];

const ALLOWED_SELINUX_TYPES: [&str; 5] = [
    "",
    "container_t",
    "container_init_t",
    "container_kvm_t",
    "container_engine_t",
];

const SAFE_SYSCTLS: [&str; 10] = [
    "kernel.shm_rmid_forced",
    "net.ipv4.ip_local_port_range",
    "net.ipv4.ip_unprivileged_port_start",
    "net.ipv4.tcp_syncookies",
    "net.ipv4.ping_group_range",
    "net.ipv4.ip_local_reserved_ports",
    "net.ipv4.tcp_keepalive_time",
    "net.ipv4.tcp_fin_timeout",
    "net.ipv4.tcp_keepalive_intvl",
    "net.ipv4.tcp_keepalive_probes",
];

pub fn checks() -> Vec<Check> {
    let check = |id: &'static str, evaluate: CheckFn| Check {
        id,
        level: Level::Baseline,
        versions: vec![VersionedCheck {
            minimum_version: Version::V(1, 0),
            evaluate,
        }],
        overrides: &[],
    };
    vec![
        check("appArmorProfile", app_armor_profile),
        check("capabilities_baseline", capabilities_baseline),
        check("hostNamespaces", host_namespaces),
        check("hostPathVolumes", host_path_volumes),
        check("hostPorts", host_ports),
        check("hostProcess", host_process),
        check("privileged", privileged),
        check("procMount", proc_mount),
        check("seLinuxOptions", se_linux_options),
        check("seccompProfile_baseline", seccomp_profile_baseline),
        check("sysctls", sysctls),
    ]
}

fn allowed_app_armor_annotation(value: &str) -> bool {
    value == "runtime/default" || value.starts_with("localhost/")
}

pub fn app_armor_profile(metadata: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let mut details = Vec::new();

    let bad_annotations: Vec<String> = metadata
        .annotations
        .iter()
        .flatten()
        .filter(|(k, v)| k.starts_with(APPARMOR_ANNOTATION_PREFIX) && !allowed_app_armor_annotation(v))
        .map(|(k, v)| format!("{k}={v:?}"))
        .collect();
    if !bad_annotations.is_empty() {
        details.push(bad_annotations.join(", "));
    }

    let unconfined = |ty: Option<&str>| ty == Some("Unconfined");
    let pod_bad = unconfined(
        spec.security_context
            .as_ref()
            .and_then(|sc| sc.app_armor_profile.as_ref())
            .map(|p| p.type_.as_str()),
    );
    let bad_containers: Vec<&str> = visit_containers(spec)
        .filter(|c| {
            unconfined(
                c.security_context
                    .and_then(|sc| sc.app_armor_profile.as_ref())
                    .map(|p| p.type_.as_str()),
            )
        })
        .map(|c| c.name)
        .collect();
    if pod_bad || !bad_containers.is_empty() {
        details.push(format!(
            "{} must not set appArmorProfile.type to \"Unconfined\"",
            setters_phrase(pod_bad, &bad_containers)
        ));
    }

    if details.is_empty() {
        CheckResult::allowed()
    } else {
        CheckResult::forbidden("forbidden AppArmor profile", details.join("; "))
    }
}

pub fn capabilities_baseline(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let mut bad_containers = Vec::new();
    let mut bad_capabilities: Vec<&str> = Vec::new();

    for c in visit_containers(spec) {
        let added = c
            .security_context
            .and_then(|sc| sc.capabilities.as_ref())
            .and_then(|caps| caps.add.as_deref())
            .unwrap_or_default();
        let mut container_bad = false;
        for cap in added {
            if !DEFAULT_CAPABILITIES.contains(&cap.as_str()) {
                container_bad = true;
                if !bad_capabilities.contains(&cap.as_str()) {
                    bad_capabilities.push(cap.as_str());
                }
            }
        }
        if container_bad {
            bad_containers.push(c.name);
        }
    }

    if bad_containers.is_empty() {
        return CheckResult::allowed();
    }
    CheckResult::forbidden(
        "non-default capabilities",
        format!(
            "{} must not include {} in securityContext.capabilities.add",
            containers_phrase(&bad_containers),
            quoted(&bad_capabilities)
        ),
    )
}

pub fn host_namespaces(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let mut set = Vec::new();
    if spec.host_network == Some(true) {
        set.push("hostNetwork=true");
    }
    if spec.host_pid == Some(true) {
        set.push("hostPID=true");
    }
    if spec.host_ipc == Some(true) {
        set.push("hostIPC=true");
    }

    if set.is_empty() {
        CheckResult::allowed()
    } else {
        CheckResult::forbidden("host namespaces", set.join(", "))
    }
}

pub fn host_path_volumes(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let names: Vec<&str> = spec
        .volumes
        .iter()
        .flatten()
        .filter(|v| v.host_path.is_some())
        .map(|v| v.name.as_str())
        .collect();

    if names.is_empty() {
        return CheckResult::allowed();
    }
    let noun = if names.len() == 1 { "volume" } else { "volumes" };
    CheckResult::forbidden("hostPath volumes", format!("{noun} {}", quoted(&names)))
}

pub fn host_ports(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let mut bad_containers = Vec::new();
    let mut ports = Vec::new();

    for c in visit_containers(spec) {
        let mut container_bad = false;
        for port in c.ports {
            if let Some(host_port) = port.host_port.filter(|p| *p != 0) {
                container_bad = true;
                if !ports.contains(&host_port) {
                    ports.push(host_port);
                }
            }
        }
        if container_bad {
            bad_containers.push(c.name);
        }
    }

    if bad_containers.is_empty() {
        return CheckResult::allowed();
    }
    let verb = if bad_containers.len() == 1 { "uses" } else { "use" };
    let noun = if ports.len() == 1 { "hostPort" } else { "hostPorts" };
    let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
    CheckResult::forbidden(
        "hostPort",
        format!(
            "{} {verb} {noun} {}",
            containers_phrase(&bad_containers),
            ports.join(", ")
        ),
    )
}

pub fn host_process(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let pod_bad = spec
        .security_context
        .as_ref()
        .and_then(|sc| sc.windows_options.as_ref())
        .and_then(|w| w.host_process)
        == Some(true);
    let bad_containers: Vec<&str> = visit_containers(spec)
        .filter(|c| {
            c.security_context
                .and_then(|sc| sc.windows_options.as_ref())
                .and_then(|w| w.host_process)
                == Some(true)
        })
        .map(|c| c.name)
        .collect();

    if !pod_bad && bad_containers.is_empty() {
        return CheckResult::allowed();
    }
    CheckResult::forbidden(
        "hostProcess",
        format!(
            "{} must not set securityContext.windowsOptions.hostProcess=true",
            setters_phrase(pod_bad, &bad_containers)
        ),
    )
}

pub fn privileged(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let bad_containers: Vec<&str> = visit_containers(spec)
        .filter(|c| c.security_context.and_then(|sc| sc.privileged) == Some(true))
        .map(|c| c.name)
        .collect();

    if bad_containers.is_empty() {
        return CheckResult::allowed();
    }
    CheckResult::forbidden(
        "privileged",
        format!(
            "{} must not set securityContext.privileged=true",
            containers_phrase(&bad_containers)
        ),
    )
}

pub fn proc_mount(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let mut bad_containers = Vec::new();
    let mut values: Vec<&str> = Vec::new();

    for c in visit_containers(spec) {
        if let Some(mount) = c.security_context.and_then(|sc| sc.proc_mount.as_deref()) {
            if mount != "Default" {
                bad_containers.push(c.name);
                if !values.contains(&mount) {
                    values.push(mount);
                }
            }
        }
    }

    if bad_containers.is_empty() {
        return CheckResult::allowed();
    }
    CheckResult::forbidden(
        "procMount",
        format!(
            "{} must not set securityContext.procMount to {}",
            containers_phrase(&bad_containers),
            quoted(&values)
        ),
    )
}

pub fn se_linux_options(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let mut bad_fields: Vec<String> = Vec::new();
    let mut inspect = |opts: &SELinuxOptions| {
        let mut fields = Vec::new();
        let ty = opts.type_.as_deref().unwrap_or_default();
        if !ALLOWED_SELINUX_TYPES.contains(&ty) {
            fields.push(format!("type {ty:?}"));
        }
        for (name, value) in [("user", &opts.user), ("role", &opts.role)] {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                fields.push(format!("{name} {value:?}"));
            }
        }
        for field in &fields {
            if !bad_fields.contains(field) {
                bad_fields.push(field.clone());
            }
        }
        !fields.is_empty()
    };

    let pod_bad = spec
        .security_context
        .as_ref()
        .and_then(|sc| sc.se_linux_options.as_ref())
        .is_some_and(&mut inspect);
    let mut bad_containers = Vec::new();
    for c in visit_containers(spec) {
        if c.security_context
            .and_then(|sc| sc.se_linux_options.as_ref())
            .is_some_and(&mut inspect)
        {
            bad_containers.push(c.name);
        }
    }

    if !pod_bad && bad_containers.is_empty() {
        return CheckResult::allowed();
    }
    CheckResult::forbidden(
        "seLinuxOptions",
        format!(
            "{} set forbidden securityContext.seLinuxOptions: {}",
            setters_phrase(pod_bad, &bad_containers),
            bad_fields.join("; ")
        ),
    )
}

pub fn seccomp_profile_baseline(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let unconfined = |ty: Option<&str>| ty == Some("Unconfined");
    let pod_bad = unconfined(
        spec.security_context
            .as_ref()
            .and_then(|sc| sc.seccomp_profile.as_ref())
            .map(|p| p.type_.as_str()),
    );
    let bad_containers: Vec<&str> = visit_containers(spec)
        .filter(|c| {
            unconfined(
                c.security_context
                    .and_then(|sc| sc.seccomp_profile.as_ref())
                    .map(|p| p.type_.as_str()),
            )
        })
        .map(|c| c.name)
        .collect();

    if !pod_bad && bad_containers.is_empty() {
        return CheckResult::allowed();
    }
    CheckResult::forbidden(
        "seccompProfile",
        format!(
            "{} must not set securityContext.seccompProfile.type to \"Unconfined\"",
            setters_phrase(pod_bad, &bad_containers)
        ),
    )
}

pub fn sysctls(_: &ObjectMeta, spec: &PodSpec) -> CheckResult {
    let forbidden: Vec<&str> = spec
        .security_context
        .as_ref()
        .and_then(|sc| sc.sysctls.as_deref())
        .unwrap_or_default()
        .iter()
        .map(|s| s.name.as_str())
        .filter(|name| !SAFE_SYSCTLS.contains(name))
        .collect();

    if forbidden.is_empty() {
        CheckResult::allowed()
    } else {
        CheckResult::forbidden("forbidden sysctls", forbidden.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{
        AppArmorProfile, Capabilities, ContainerPort, HostPathVolumeSource, PodSecurityContext,
        SeccompProfile, SecurityContext, Sysctl, Volume, WindowsSecurityContextOptions,
    };

    use super::*;
    use crate::policy::testing::*;

    fn meta() -> ObjectMeta {
        ObjectMeta::default()
    }

    #[test]
    fn test_baseline_allows_restricted_spec() {
        let spec = restricted_spec();
        for check in checks() {
            let result = (check.versions[0].evaluate)(&meta(), &spec);
            assert!(result.allowed, "{}: {}", check.id, result.forbidden_detail);
        }
    }

    #[test]
    fn test_app_armor_annotation_and_field() {
        let mut metadata = meta();
        metadata.annotations = Some(BTreeMap::from([
            (
                format!("{APPARMOR_ANNOTATION_PREFIX}app"),
                "unconfined".to_string(),
            ),
            (
                format!("{APPARMOR_ANNOTATION_PREFIX}sidecar"),
                "localhost/custom".to_string(),
            ),
        ]));
        let mut spec = restricted_spec();
        spec.containers[0]
            .security_context
            .as_mut()
            .unwrap()
            .app_armor_profile = Some(AppArmorProfile {
            type_: "Unconfined".to_string(),
            ..Default::default()
        });

        let result = app_armor_profile(&metadata, &spec);
        assert!(!result.allowed);
        assert_eq!(result.forbidden_reason, "forbidden AppArmor profile");
        assert_eq!(
            result.forbidden_detail,
            "container.apparmor.security.beta.kubernetes.io/app=\"unconfined\"; \
             container \"app\" must not set appArmorProfile.type to \"Unconfined\""
        );
    }

    #[test]
    fn test_capabilities_baseline() {
        let mut spec = restricted_spec();
        spec.containers[0].security_context.as_mut().unwrap().capabilities = Some(Capabilities {
            add: Some(vec!["CHOWN".to_string(), "NET_ADMIN".to_string()]),
            drop: Some(vec!["ALL".to_string()]),
        });

        let result = capabilities_baseline(&meta(), &spec);
        assert!(!result.allowed);
        assert_eq!(
            result.forbidden_detail,
            "container \"app\" must not include \"NET_ADMIN\" in securityContext.capabilities.add"
        );
    }

    #[test]
    fn test_host_namespaces() {
        let mut spec = restricted_spec();
        spec.host_network = Some(true);
        spec.host_ipc = Some(false);
        spec.host_pid = Some(true);

        let result = host_namespaces(&meta(), &spec);
        assert!(!result.allowed);
        assert_eq!(result.forbidden_detail, "hostNetwork=true, hostPID=true");
    }

    #[test]
    fn test_host_path_volumes() {
        let mut spec = restricted_spec();
        spec.volumes = Some(vec![
            Volume {
                name: "data".to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: "/var/lib/data".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "scratch".to_string(),
                empty_dir: Some(Default::default()),
                ..Default::default()
            },
        ]);

        let result = host_path_volumes(&meta(), &spec);
        assert!(!result.allowed);
        assert_eq!(result.forbidden_detail, "volume \"data\"");
    }

    #[test]
    fn test_host_ports_ignores_zero() {
        let mut spec = restricted_spec();
        spec.containers[0].ports = Some(vec![
            ContainerPort {
                container_port: 80,
                host_port: Some(0),
                ..Default::default()
            },
        ]);
        assert!(host_ports(&meta(), &spec).allowed);

        spec.containers[0].ports.as_mut().unwrap().push(ContainerPort {
            container_port: 443,
            host_port: Some(8443),
            ..Default::default()
        });
        let result = host_ports(&meta(), &spec);
        assert!(!result.allowed);
        assert_eq!(result.forbidden_detail, "container \"app\" uses hostPort 8443");
    }

    #[test]
    fn test_host_process() {
        let mut spec = restricted_spec();
        spec.security_context.as_mut().unwrap().windows_options =
            Some(WindowsSecurityContextOptions {
                host_process: Some(true),
                ..Default::default()
            });

        let result = host_process(&meta(), &spec);
        assert!(!result.allowed);
        assert_eq!(
            result.forbidden_detail,
            "pod must not set securityContext.windowsOptions.hostProcess=true"
        );
    }

    #[test]
    fn test_privileged_includes_init_containers() {
        let mut spec = restricted_spec();
        let mut init = container("setup");
        init.security_context = Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        });
        spec.init_containers = Some(vec![init]);

        let result = privileged(&meta(), &spec);
        assert!(!result.allowed);
        assert_eq!(
            result.forbidden_detail,
            "container \"setup\" must not set securityContext.privileged=true"
        );
    }

    #[test]
    fn test_proc_mount() {
        let mut spec = restricted_spec();
        spec.containers[0].security_context.as_mut().unwrap().proc_mount =
            Some("Default".to_string());
        assert!(proc_mount(&meta(), &spec).allowed);

        spec.containers[0].security_context.as_mut().unwrap().proc_mount =
            Some("Unmasked".to_string());
        let result = proc_mount(&meta(), &spec);
        assert!(!result.allowed);
        assert_eq!(
            result.forbidden_detail,
            "container \"app\" must not set securityContext.procMount to \"Unmasked\""
        );
    }

    #[test]
    fn test_se_linux_options() {
        let mut spec = restricted_spec();
        spec.security_context.as_mut().unwrap().se_linux_options = Some(SELinuxOptions {
            level: Some("s0:c0,c1".to_string()),
            type_: Some("container_t".to_string()),
            ..Default::default()
        });
        assert!(se_linux_options(&meta(), &spec).allowed);

        spec.containers[0].security_context.as_mut().unwrap().se_linux_options =
            Some(SELinuxOptions {
                type_: Some("spc_t".to_string()),
                user: Some("system_u".to_string()),
                ..Default::default()
            });
        let result = se_linux_options(&meta(), &spec);
        assert!(!result.allowed);
        assert_eq!(
            result.forbidden_detail,
            "container \"app\" set forbidden securityContext.seLinuxOptions: \
             type \"spc_t\"; user \"system_u\""
        );
    }

    #[test]
    fn test_seccomp_profile_baseline() {
        let mut spec = restricted_spec();
        spec.security_context = Some(PodSecurityContext {
            seccomp_profile: Some(SeccompProfile {
                type_: "Unconfined".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });

        let result = seccomp_profile_baseline(&meta(), &spec);
        assert!(!result.allowed);
        assert_eq!(
            result.forbidden_detail,
            "pod must not set securityContext.seccompProfile.type to \"Unconfined\""
        );
    }

    #[test]
    fn test_sysctls() {
        let mut spec = restricted_spec();
        spec.security_context.as_mut().unwrap().sysctls = Some(vec![
            Sysctl {
                name: "net.ipv4.tcp_syncookies".to_string(),
                value: "1".to_string(),
            },
            Sysctl {
                name: "kernel.msgmax".to_string(),
                value: "65536".to_string(),
            },
        ]);

        let result = sysctls(&meta(), &spec);
        assert!(!result.allowed);
        assert_eq!(result.forbidden_detail, "kernel.msgmax");
    }
}
