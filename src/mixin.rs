use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::pod::{
    DEFAULT_NON_ROOT_USER, drop_all, restricted_container_security_context,
    restricted_pod_security_context, runtime_default_seccomp_profile,
};
use crate::policy::{Evaluator, LevelVersion, aggregate_check_results};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MixinError {
    #[error("failed to make pod {pod} restricted: {detail}")]
    NotRestricted { pod: String, detail: String },
}

/// Like [`mixin_restricted_pod_security`], but fails the calling test on
/// error.
#[track_caller]
pub fn must_mixin_restricted_pod_security<'a>(evaluator: &Evaluator, pod: &'a mut Pod) -> &'a mut Pod {
    if let Err(e) = mixin_restricted_pod_security(evaluator, pod) {
        panic!("{e}");
    }
    pod
}

/// Makes `pod` compliant with the latest restricted level by filling in
/// unset security context fields. Fields the caller set are never changed,
/// so a conflicting explicit value surfaces as an error.
///
/// The pod is modified in place even when an error is returned. A default
/// `runAsUser` is set; see [`restricted_pod_security_context`].
pub fn mixin_restricted_pod_security(evaluator: &Evaluator, pod: &mut Pod) -> Result<(), MixinError> {
    let name = pod.name_any();
    let spec = pod.spec.get_or_insert_with(Default::default);

    match spec.security_context.as_mut() {
        None => {
            debug!(pod = %name, "installing restricted pod security context");
            spec.security_context = Some(restricted_pod_security_context());
        }
        Some(sc) => {
            if sc.run_as_non_root.is_none() {
                debug!(pod = %name, "defaulting runAsNonRoot");
                sc.run_as_non_root = Some(true);
            }
            if sc.run_as_user.is_none() {
                debug!(pod = %name, user = DEFAULT_NON_ROOT_USER, "defaulting runAsUser");
                sc.run_as_user = Some(DEFAULT_NON_ROOT_USER);
            }
            if sc.seccomp_profile.is_none() {
                debug!(pod = %name, "defaulting seccompProfile");
                sc.seccomp_profile = Some(runtime_default_seccomp_profile());
            }
        }
    }

    for container in spec.containers.iter_mut() {
        mixin_restricted_container_security_context(container);
    }
    for container in spec.init_containers.iter_mut().flatten() {
        mixin_restricted_container_security_context(container);
    }

    let restricted = LevelVersion::restricted_latest();
    let agg = aggregate_check_results(&evaluator.evaluate_pod(restricted, &pod.metadata, spec));
    if !agg.allowed {
        let detail = agg.forbidden_detail();
        warn!(pod = %name, level = %restricted, detail = %detail, "pod is not restricted after mixin");
        return Err(MixinError::NotRestricted { pod: name, detail });
    }

    debug!(pod = %name, level = %restricted, "pod is restricted");
    Ok(())
}

// Non-conformance is reported by the evaluation in the caller.
fn mixin_restricted_container_security_context(container: &mut Container) {
    match container.security_context.as_mut() {
        None => container.security_context = Some(restricted_container_security_context()),
        Some(sc) => {
            if sc.allow_privilege_escalation.is_none() {
                sc.allow_privilege_escalation = Some(false);
            }
            let caps = sc.capabilities.get_or_insert_with(Default::default);
            if caps.drop.as_ref().is_none_or(Vec::is_empty) {
                caps.drop = Some(drop_all());
            }
        }
    }
}
