//! Privilege escalation helper detection.
//!
//! The helper is probed once per process: `pkexec` first, then `sudo`. A helper counts as
//! available when its binary resolves on `PATH`. Probing never runs the helper, so it cannot
//! trigger an authentication prompt; a helper that resolves but then fails surfaces later as a task
//! error.

use crate::PrivilegeSource;

use std::path::PathBuf;
use std::sync::OnceLock;

/// Privilege escalation mechanism.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum PrivilegeMethod {
    #[default]
    None,
    Pkexec,
    Sudo,
}

impl PrivilegeMethod {
    /// Helper binary name, or `None` for `PrivilegeMethod::None`.
    pub fn program(self) -> Option<&'static str> {
        match self {
            PrivilegeMethod::None => None,
            PrivilegeMethod::Pkexec => Some("pkexec"),
            PrivilegeMethod::Sudo => Some("sudo"),
        }
    }

    /// Arguments inserted between the helper and the escalated command.
    ///
    /// `sudo -n` fails instead of prompting for a password on a terminal nobody is watching.
    pub(crate) fn helper_args(self) -> &'static [&'static str] {
        match self {
            PrivilegeMethod::Sudo => &["-n"],
            PrivilegeMethod::None | PrivilegeMethod::Pkexec => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PrivilegeMethod::None => "none",
            PrivilegeMethod::Pkexec => "pkexec",
            PrivilegeMethod::Sudo => "sudo",
        }
    }
}

/// Availability check for a helper binary.
pub trait Probe {
    fn is_available(&self, program: &str) -> bool;
}

/// Probe that looks the program up on the executable search path.
#[derive(Clone, Copy, Debug, Default)]
pub struct SearchPath;

impl Probe for SearchPath {
    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Memoizing resolver over a `Probe`.
///
/// The first `resolve` call probes in priority order; every later call returns the cached method.
#[derive(Debug, Default)]
pub struct Resolver<P> {
    probe: P,
    resolved: OnceLock<PrivilegeMethod>,
}

impl<P: Probe> Resolver<P> {
    pub const fn new(probe: P) -> Self {
        Self {
            probe,
            resolved: OnceLock::new(),
        }
    }

    pub fn resolve(&self) -> PrivilegeMethod {
        *self.resolved.get_or_init(|| {
            let method = [PrivilegeMethod::Pkexec, PrivilegeMethod::Sudo]
                .into_iter()
                .find(|m| m.program().is_some_and(|p| self.probe.is_available(p)))
                .unwrap_or(PrivilegeMethod::None);

            #[cfg(feature = "tracing")]
            tracing::info!(method = method.as_str(), "privilege method resolved");

            method
        })
    }
}

static PROCESS_RESOLVER: Resolver<SearchPath> = Resolver::new(SearchPath);

/// Resolve the process-wide privilege method (probed on first use, cached afterwards).
pub fn resolve() -> PrivilegeMethod {
    PROCESS_RESOLVER.resolve()
}

/// Helper invocation derived from a `PrivilegeSource`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Helper {
    pub(crate) method: PrivilegeMethod,
    pub(crate) program: PathBuf,
}

impl Helper {
    /// `None` when no escalation method is usable.
    pub(crate) fn from_source(source: &PrivilegeSource) -> Option<Self> {
        let (method, program) = match source {
            PrivilegeSource::Detect => {
                let method = resolve();
                (method, PathBuf::from(method.program()?))
            }
            PrivilegeSource::Fixed(method) => (*method, PathBuf::from(method.program()?)),
            PrivilegeSource::Program { method, program } => {
                method.program()?;
                (*method, program.clone())
            }
        };
        Some(Self { method, program })
    }

    /// Full helper argv tail: `[helper args..., command, args...]`.
    pub(crate) fn argv(&self, command: &str, args: &[String]) -> Vec<String> {
        let mut argv: Vec<String> = self
            .method
            .helper_args()
            .iter()
            .map(|s| s.to_string())
            .collect();
        argv.push(command.to_string());
        argv.extend(args.iter().cloned());
        argv
    }
}
