use crate::{Error, Result, TaskId, TaskReceiver, TaskRequest, util};

use std::io::Write;
use std::sync::Arc;

/// Package management operations (install/remove/update).
///
/// Commands run as `<package_manager> <verb> -y <packages...>` (default package manager: `dnf`).
#[derive(Clone, Debug)]
pub struct Packages {
    inner: Arc<crate::Inner>,
}

impl Packages {
    pub(crate) fn new(inner: Arc<crate::Inner>) -> Self {
        Self { inner }
    }

    /// Install one or more packages.
    pub fn install(
        &self,
        packages: &[&str],
        receiver: Option<Arc<dyn TaskReceiver>>,
    ) -> Result<TaskId> {
        let req = package_request(
            &self.inner.opts.package_manager,
            PackageVerb::Install,
            packages,
        )?;
        self.inner.enqueue(req.receiver_opt(receiver), None, None)
    }

    /// Remove one or more packages.
    pub fn remove(
        &self,
        packages: &[&str],
        receiver: Option<Arc<dyn TaskReceiver>>,
    ) -> Result<TaskId> {
        let req = package_request(
            &self.inner.opts.package_manager,
            PackageVerb::Remove,
            packages,
        )?;
        self.inner.enqueue(req.receiver_opt(receiver), None, None)
    }

    /// Update the given packages, or every installed package when `packages` is empty.
    pub fn update(
        &self,
        packages: &[&str],
        receiver: Option<Arc<dyn TaskReceiver>>,
    ) -> Result<TaskId> {
        let req = package_request(
            &self.inner.opts.package_manager,
            PackageVerb::Update,
            packages,
        )?;
        self.inner.enqueue(req.receiver_opt(receiver), None, None)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PackageVerb {
    Install,
    Remove,
    Update,
}

fn package_request(manager: &str, verb: PackageVerb, packages: &[&str]) -> Result<TaskRequest> {
    if packages.is_empty() && verb != PackageVerb::Update {
        return Err(Error::invalid_input("packages must not be empty"));
    }
    for p in packages {
        util::validate_operand("package", p)?;
    }
    let list = packages.join(" ");

    let (arg, description) = match verb {
        PackageVerb::Install => ("install", format!("Installing packages: {list}")),
        PackageVerb::Remove => ("remove", format!("Removing packages: {list}")),
        PackageVerb::Update if packages.is_empty() => {
            ("update", "Updating all packages".to_string())
        }
        PackageVerb::Update => ("update", format!("Updating packages: {list}")),
    };

    let mut args = vec![arg.to_string(), "-y".to_string()];
    args.extend(packages.iter().map(|p| p.to_string()));
    Ok(TaskRequest::new(manager, args).description(description))
}

/// Repository operations via `<package_manager> config-manager`.
#[derive(Clone, Debug)]
pub struct Repositories {
    inner: Arc<crate::Inner>,
}

impl Repositories {
    pub(crate) fn new(inner: Arc<crate::Inner>) -> Self {
        Self { inner }
    }

    pub fn enable(&self, repo: &str, receiver: Option<Arc<dyn TaskReceiver>>) -> Result<TaskId> {
        util::validate_operand("repository", repo)?;
        let req = TaskRequest::new(
            self.inner.opts.package_manager.as_str(),
            ["config-manager", "--enable", repo],
        )
        .description(format!("Enabling repository: {repo}"));
        self.inner.enqueue(req.receiver_opt(receiver), None, None)
    }

    pub fn disable(&self, repo: &str, receiver: Option<Arc<dyn TaskReceiver>>) -> Result<TaskId> {
        util::validate_operand("repository", repo)?;
        let req = TaskRequest::new(
            self.inner.opts.package_manager.as_str(),
            ["config-manager", "--disable", repo],
        )
        .description(format!("Disabling repository: {repo}"));
        self.inner.enqueue(req.receiver_opt(receiver), None, None)
    }

    /// Add a repository from a `.repo` URL. `name` is only used for the description.
    pub fn add(
        &self,
        url: &str,
        name: &str,
        receiver: Option<Arc<dyn TaskReceiver>>,
    ) -> Result<TaskId> {
        util::validate_operand("repository url", url)?;
        util::validate_no_control("repository name", name)?;
        let req = TaskRequest::new(
            self.inner.opts.package_manager.as_str(),
            ["config-manager", "--add-repo", url],
        )
        .description(format!("Adding repository: {name}"));
        self.inner.enqueue(req.receiver_opt(receiver), None, None)
    }
}

/// Service control via `<service_manager> <verb> <unit>` (default: `systemctl`).
///
/// Shorthand names are canonicalized (`"sshd"` becomes `"sshd.service"`).
#[derive(Clone, Debug)]
pub struct Services {
    inner: Arc<crate::Inner>,
}

impl Services {
    pub(crate) fn new(inner: Arc<crate::Inner>) -> Self {
        Self { inner }
    }

    pub fn enable(&self, service: &str, receiver: Option<Arc<dyn TaskReceiver>>) -> Result<TaskId> {
        self.service_like("enable", "Enabling", service, receiver)
    }

    pub fn disable(
        &self,
        service: &str,
        receiver: Option<Arc<dyn TaskReceiver>>,
    ) -> Result<TaskId> {
        self.service_like("disable", "Disabling", service, receiver)
    }

    pub fn restart(
        &self,
        service: &str,
        receiver: Option<Arc<dyn TaskReceiver>>,
    ) -> Result<TaskId> {
        self.service_like("restart", "Restarting", service, receiver)
    }

    fn service_like(
        &self,
        verb: &'static str,
        label: &'static str,
        service: &str,
        receiver: Option<Arc<dyn TaskReceiver>>,
    ) -> Result<TaskId> {
        let unit = util::canonicalize_unit_name(service)?;
        let req = TaskRequest::new(
            self.inner.opts.service_manager.as_str(),
            [verb, unit.as_str()],
        )
        .description(format!("{label} service: {}", service.trim()));
        self.inner.enqueue(req.receiver_opt(receiver), None, None)
    }
}

/// Writes and deletes of files the current user cannot touch directly.
#[derive(Clone, Debug)]
pub struct SystemFiles {
    inner: Arc<crate::Inner>,
}

impl SystemFiles {
    pub(crate) fn new(inner: Arc<crate::Inner>) -> Self {
        Self { inner }
    }

    /// Replace (or create) `path` with `contents`.
    ///
    /// The contents are staged in a private temporary file, which is kept until the task reaches a
    /// terminal state, and copied into place with `cp --no-preserve=mode` so a new file gets
    /// default permissions rather than the staging file's `0600`.
    pub fn write(
        &self,
        path: &str,
        contents: &[u8],
        receiver: Option<Arc<dyn TaskReceiver>>,
    ) -> Result<TaskId> {
        util::validate_system_path(path)?;
        let staged = self.stage(contents)?;
        let source = staged.to_str().ok_or_else(|| Error::IoError {
            context: "staging path is not valid UTF-8".to_string(),
        })?;

        let req = TaskRequest::new("cp", ["--no-preserve=mode", source, path])
            .description(format!("Writing system file: {path}"));
        self.inner
            .enqueue(req.receiver_opt(receiver), Some(staged), None)
    }

    pub fn delete(&self, path: &str, receiver: Option<Arc<dyn TaskReceiver>>) -> Result<TaskId> {
        util::validate_system_path(path)?;
        let req =
            TaskRequest::new("rm", [path]).description(format!("Deleting system file: {path}"));
        self.inner.enqueue(req.receiver_opt(receiver), None, None)
    }

    fn stage(&self, contents: &[u8]) -> Result<tempfile::TempPath> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("privexec-");
            b
        };
        let file = match &self.inner.opts.staging_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };
        let mut file = file.map_err(|e| Error::IoError {
            context: format!("create staging file: {e}"),
        })?;
        file.write_all(contents)
            .and_then(|()| file.flush())
            .map_err(|e| Error::IoError {
                context: format!("write staging file: {e}"),
            })?;
        Ok(file.into_temp_path())
    }
}
