use crate::PrivilegeMethod;

use std::path::PathBuf;
use std::time::Duration;

/// Where the executor gets its privilege escalation helper from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum PrivilegeSource {
    /// Probe `pkexec`, then `sudo`, once per process (see `privilege::resolve`).
    #[default]
    Detect,
    /// Use a fixed method without probing. `Fixed(PrivilegeMethod::None)` makes every task fail
    /// with `Error::NoPrivilegeMethod`.
    Fixed(PrivilegeMethod),
    /// Use `method`'s argument convention, but launch `program` instead of the default helper
    /// binary (e.g. a helper installed outside `PATH`).
    Program {
        method: PrivilegeMethod,
        program: PathBuf,
    },
}

/// Configuration options for `Executor`.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ExecutorOptions {
    /// Deadline applied to tasks that do not set their own `TaskRequest::timeout`.
    pub default_timeout: Duration,

    /// Maximum merged output retained per task. Progress events are not affected.
    pub output_max_bytes: usize,

    /// Read buffer size per output stream; one progress event is emitted per read.
    pub read_chunk_bytes: usize,

    /// How long a timed-out or cancelled command gets to exit after each stop attempt
    /// (`SIGTERM`, `SIGKILL`, kill through the helper) before the next one is tried.
    pub kill_grace: Duration,

    /// Privilege helper selection.
    pub privilege: PrivilegeSource,

    /// Package manager used by `Packages` and `Repositories`.
    ///
    /// Default: `dnf`.
    pub package_manager: String,

    /// Service manager used by `Services`.
    ///
    /// Default: `systemctl`.
    pub service_manager: String,

    /// Directory for staged system file contents. `None` uses the system temp directory.
    pub staging_dir: Option<PathBuf>,

    /// Prefix for the names of the engine and dispatcher threads.
    pub thread_name_prefix: String,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            output_max_bytes: 1024 * 1024,
            read_chunk_bytes: 4 * 1024,
            kill_grace: Duration::from_secs(2),
            privilege: PrivilegeSource::Detect,
            package_manager: "dnf".to_string(),
            service_manager: "systemctl".to_string(),
            staging_dir: None,
            thread_name_prefix: "privexec".to_string(),
        }
    }
}

impl ExecutorOptions {
    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.default_timeout.is_zero() {
            return Err(crate::Error::invalid_input("default_timeout must be > 0"));
        }
        if self.kill_grace.is_zero() {
            return Err(crate::Error::invalid_input("kill_grace must be > 0"));
        }
        if self.read_chunk_bytes == 0 {
            return Err(crate::Error::invalid_input("read_chunk_bytes must be > 0"));
        }
        crate::util::validate_program("package_manager", &self.package_manager)?;
        crate::util::validate_program("service_manager", &self.service_manager)?;
        Ok(())
    }
}
