use std::{fmt, str::FromStr};

use crate::{
    pod::{InjectionSetting, NamespaceView, PodView},
    Error,
};

/// Any container whose name contains this has already been injected.
pub const SIDECAR_MARKER: &str = "cortexflow-proxy";

/// What to do with a Pod whose `metadata` or `spec.containers` is missing or
/// not the expected shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingFieldPolicy {
    /// Treat the missing parts as "nothing conflicting, no opt-out".
    #[default]
    Allow,
    /// Refuse to inject into anything we cannot fully read.
    Deny,
}

impl FromStr for MissingFieldPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(MissingFieldPolicy::Allow),
            "deny" => Ok(MissingFieldPolicy::Deny),
            other => Err(Error::ConfigError(format!(
                "invalid missing-field policy '{other}', expected 'allow' or 'deny'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Eligible,
    AlreadyInjected,
    MalformedPod,
    NamespaceDisabled,
    PodDisabled,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reason::Eligible => "eligible",
            Reason::AlreadyInjected => "already injected",
            Reason::MalformedPod => "malformed pod",
            Reason::NamespaceDisabled => "namespace injection disabled",
            Reason::PodDisabled => "pod injection disabled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub reason: Reason,
}

impl Verdict {
    pub fn allowed(&self) -> bool {
        self.reason == Reason::Eligible
    }
}

impl From<Reason> for Verdict {
    fn from(reason: Reason) -> Self {
        Verdict { reason }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator {
    pub missing_fields: MissingFieldPolicy,
}

impl Evaluator {
    pub fn new(missing_fields: MissingFieldPolicy) -> Self {
        Evaluator { missing_fields }
    }

    /// Rules run in order and the first rejection wins.
    pub fn evaluate(&self, pod: PodView<'_>, namespace: Option<NamespaceView<'_>>) -> Verdict {
        if pod
            .container_names()
            .any(|name| name.contains(SIDECAR_MARKER))
        {
            return Reason::AlreadyInjected.into();
        }

        if self.missing_fields == MissingFieldPolicy::Deny
            && (pod.metadata().is_none() || pod.containers().is_none())
        {
            return Reason::MalformedPod.into();
        }

        let namespace_setting = namespace
            .map(|x| x.injection_setting())
            .unwrap_or_default();
        if namespace_setting == InjectionSetting::Disabled {
            return Reason::NamespaceDisabled.into();
        }

        if pod.injection_setting() == InjectionSetting::Disabled {
            return Reason::PodDisabled.into();
        }

        Reason::Eligible.into()
    }
}
