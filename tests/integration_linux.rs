#![cfg(target_os = "linux")]

// End-to-end tests against real subprocesses.
//
// `/usr/bin/env` stands in for the escalation helper: with the `pkexec` argument convention the
// helper is invoked as `<helper> <command> <args...>`, which `env` simply executes. No privileges
// are required.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use privexec::{
    Error, EventStream, Executor, ExecutorOptions, PrivilegeMethod, PrivilegeSource, TaskEvent,
    TaskEventKind, TaskId, TaskOutput, TaskReceiver, TaskRequest,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn block_on<T>(fut: impl Future<Output = T>) -> T {
    #[cfg(feature = "rt-async-io")]
    {
        smol::block_on(fut)
    }

    #[cfg(feature = "rt-tokio")]
    {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("init tokio runtime");
        rt.block_on(fut)
    }
}

fn find_executable(candidates: &[&str]) -> Option<String> {
    for c in candidates {
        if std::path::Path::new(c).exists() {
            return Some((*c).to_string());
        }
    }
    None
}

fn env_helper() -> Option<PrivilegeSource> {
    let program = find_executable(&["/usr/bin/env", "/bin/env"])?;
    Some(PrivilegeSource::Program {
        method: PrivilegeMethod::Pkexec,
        program: program.into(),
    })
}

fn start(privilege: PrivilegeSource) -> Executor {
    let mut opts = ExecutorOptions::default();
    opts.privilege = privilege;
    opts.default_timeout = Duration::from_secs(20);
    Executor::start_with(opts).expect("start executor")
}

fn start_with_env_helper() -> Option<Executor> {
    match env_helper() {
        Some(privilege) => Some(start(privilege)),
        None => {
            eprintln!("env not found; skipping");
            None
        }
    }
}

fn sh(script: &str) -> TaskRequest {
    TaskRequest::new("sh", ["-c", script])
}

/// Event subscription that keeps events it was not asked for, so tests can wait for tasks in any
/// order.
struct Events {
    stream: EventStream,
    backlog: VecDeque<TaskEvent>,
}

impl Events {
    fn new(stream: EventStream) -> Self {
        Self {
            stream,
            backlog: VecDeque::new(),
        }
    }

    /// Next event matching `pred`, failing the test after `EVENT_TIMEOUT`.
    fn wait(&mut self, pred: impl Fn(&TaskEvent) -> bool) -> TaskEvent {
        if let Some(pos) = self.backlog.iter().position(&pred) {
            return self.backlog.remove(pos).expect("backlog entry");
        }
        let deadline = Instant::now() + EVENT_TIMEOUT;
        loop {
            while let Some(event) = self.stream.try_next() {
                if pred(&event) {
                    return event;
                }
                self.backlog.push_back(event);
            }
            assert!(Instant::now() < deadline, "timed out waiting for event");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Every event of `id` up to and including its terminal event.
    fn task(&mut self, id: TaskId) -> Vec<TaskEvent> {
        let mut out = Vec::new();
        loop {
            let event = self.wait(|e| e.task_id == id);
            let terminal = event.is_terminal();
            out.push(event);
            if terminal {
                return out;
            }
        }
    }
}

fn first_number(events: &[TaskEvent]) -> u32 {
    events
        .iter()
        .find_map(|e| match &e.kind {
            TaskEventKind::Progress { text } => text.parse::<u32>().ok(),
            _ => None,
        })
        .expect("pid progress event")
}

/// Wait until `pid` is gone. A zombie waiting for its new parent to reap it counts as gone.
fn process_gone(pid: u32) -> bool {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let gone = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        };
        if gone {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// `sh` plus a relay script, invoked like `pkexec <relay> <command...>`: the relay runs the
/// command as a child instead of exec'ing it, the way `sudo` does.
struct ForkingHelper {
    _dir: tempfile::TempDir,
    relay: String,
    privilege: PrivilegeSource,
}

impl ForkingHelper {
    fn new() -> Option<Self> {
        let sh = find_executable(&["/bin/sh", "/usr/bin/sh"])?;
        let dir = tempfile::tempdir().expect("tempdir");
        let relay = dir.path().join("relay.sh");
        std::fs::write(&relay, "\"$@\"\nexit $?\n").expect("write relay");
        Some(Self {
            relay: relay.to_str().expect("utf-8 path").to_string(),
            _dir: dir,
            privilege: PrivilegeSource::Program {
                method: PrivilegeMethod::Pkexec,
                program: sh.into(),
            },
        })
    }

    fn request(&self, script: &str) -> TaskRequest {
        TaskRequest::new(self.relay.as_str(), ["sh", "-c", script])
    }
}

fn terminal_kind(events: &[TaskEvent]) -> &TaskEventKind {
    &events.last().expect("at least one event").kind
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl TaskReceiver for Recorder {
    fn on_success(&self, _task_id: TaskId, output: &TaskOutput) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("success:{}", output.exit_code));
    }

    fn on_error(&self, _task_id: TaskId, error: &Error) {
        self.calls.lock().unwrap().push(format!("error:{error}"));
    }

    fn on_progress(&self, _task_id: TaskId, text: &str) {
        self.calls.lock().unwrap().push(format!("progress:{text}"));
    }

    fn on_started(&self, _task_id: TaskId, description: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("started:{description}"));
    }

    fn on_cancelled(&self, _task_id: TaskId) {
        self.calls.lock().unwrap().push("cancelled".to_string());
    }
}

#[test]
fn successful_task_reports_started_progress_and_finished() {
    let Some(executor) = start_with_env_helper() else {
        return;
    };
    let mut events = Events::new(executor.subscribe());
    let recorder = Arc::new(Recorder::default());

    let id = executor
        .submit(
            sh("echo hello")
                .description("Saying hello")
                .receiver(recorder.clone()),
        )
        .expect("submit");

    let seen = events.task(id);
    let TaskEventKind::Started { description } = &seen[0].kind else {
        panic!("first event should be Started: {seen:?}");
    };
    assert_eq!(description, "Saying hello");
    assert!(seen.iter().any(
        |e| matches!(&e.kind, TaskEventKind::Progress { text } if text == "hello")
    ));
    let TaskEventKind::Finished { output } = terminal_kind(&seen) else {
        panic!("expected Finished: {seen:?}");
    };
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.output.trim(), "hello");
    assert!(!output.truncated);

    // Receiver calls happen on the dispatcher thread after the broadcast.
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while recorder.calls.lock().unwrap().len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(
        *recorder.calls.lock().unwrap(),
        vec!["started:Saying hello", "progress:hello", "success:0"]
    );
}

#[test]
fn tasks_run_one_at_a_time_in_submission_order() {
    let Some(executor) = start_with_env_helper() else {
        return;
    };
    let mut events = Events::new(executor.subscribe());

    let ids: Vec<TaskId> = (1..=3)
        .map(|n| {
            executor
                .submit(sh(&format!("sleep 0.1; echo task{n}")))
                .expect("submit")
        })
        .collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    let mut order = Vec::new();
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while order.iter().filter(|(_, terminal)| *terminal).count() < ids.len() {
        assert!(Instant::now() < deadline, "timed out waiting for tasks");
        let event = events.wait(|e| {
            ids.contains(&e.task_id)
                && matches!(
                    e.kind,
                    TaskEventKind::Started { .. } | TaskEventKind::Finished { .. }
                )
        });
        order.push((event.task_id, event.is_terminal()));
    }

    let expected: Vec<(TaskId, bool)> = ids.iter().flat_map(|id| [(*id, false), (*id, true)]).collect();
    assert_eq!(order, expected);
}

#[test]
fn timeout_kills_the_subprocess() {
    let Some(executor) = start_with_env_helper() else {
        return;
    };
    let mut events = Events::new(executor.subscribe());

    let id = executor
        .submit(sh("echo $$; exec sleep 30").timeout(Duration::from_millis(500)))
        .expect("submit");

    let seen = events.task(id);
    let pid = seen
        .iter()
        .find_map(|e| match &e.kind {
            TaskEventKind::Progress { text } => text.parse::<u32>().ok(),
            _ => None,
        })
        .expect("pid progress event");

    let TaskEventKind::Failed { error } = terminal_kind(&seen) else {
        panic!("expected Failed: {seen:?}");
    };
    assert!(error.is_timeout(), "unexpected error: {error:?}");
    assert!(process_gone(pid), "process {pid} still exists after timeout");
    assert!(!executor.is_running(id));
}

#[test]
fn timeout_stops_the_command_a_forking_helper_runs() {
    let Some(helper) = ForkingHelper::new() else {
        return;
    };
    let executor = start(helper.privilege.clone());
    let mut events = Events::new(executor.subscribe());

    let id = executor
        .submit(
            helper
                .request("echo $$; exec sleep 30")
                .timeout(Duration::from_millis(500)),
        )
        .expect("submit");

    let seen = events.task(id);
    let pid = first_number(&seen);
    let TaskEventKind::Failed { error } = terminal_kind(&seen) else {
        panic!("expected Failed: {seen:?}");
    };
    assert!(error.is_timeout(), "unexpected error: {error:?}");
    assert!(process_gone(pid), "command {pid} outlived its helper");
}

#[test]
fn cancel_stops_the_command_a_forking_helper_runs() {
    let Some(helper) = ForkingHelper::new() else {
        return;
    };
    let executor = start(helper.privilege.clone());
    let mut events = Events::new(executor.subscribe());

    let id = executor
        .submit(helper.request("echo $$; exec sleep 30"))
        .expect("submit");
    let pid = match events
        .wait(|e| e.task_id == id && matches!(e.kind, TaskEventKind::Progress { .. }))
        .kind
    {
        TaskEventKind::Progress { text } => text.parse::<u32>().expect("pid"),
        other => panic!("unexpected event: {other:?}"),
    };

    assert!(executor.cancel(id));
    let seen = events.task(id);
    assert!(matches!(terminal_kind(&seen), TaskEventKind::Cancelled), "{seen:?}");
    assert!(process_gone(pid), "command {pid} outlived its helper");
}

#[test]
fn command_ignoring_sigterm_is_killed_and_the_queue_moves_on() {
    let Some(privilege) = env_helper() else {
        return;
    };
    let mut opts = ExecutorOptions::default();
    opts.privilege = privilege;
    opts.kill_grace = Duration::from_millis(200);
    let executor = Executor::start_with(opts).expect("start executor");
    let mut events = Events::new(executor.subscribe());

    let submitted = Instant::now();
    let stubborn = executor
        .submit(sh("trap '' TERM; echo $$; exec sleep 30").timeout(Duration::from_millis(300)))
        .expect("submit stubborn");
    let next = executor.submit(sh("echo next")).expect("submit next");

    let seen = events.task(stubborn);
    let pid = first_number(&seen);
    let TaskEventKind::Failed { error } = terminal_kind(&seen) else {
        panic!("expected Failed: {seen:?}");
    };
    assert!(error.is_timeout(), "unexpected error: {error:?}");
    assert!(process_gone(pid), "process {pid} survived SIGKILL");

    let seen = events.task(next);
    assert!(matches!(terminal_kind(&seen), TaskEventKind::Finished { .. }), "{seen:?}");
    assert!(
        submitted.elapsed() < Duration::from_secs(5),
        "queue stalled for {:?}",
        submitted.elapsed()
    );
}

#[test]
fn cancelling_a_queued_task_never_starts_it() {
    let Some(executor) = start_with_env_helper() else {
        return;
    };
    let mut events = Events::new(executor.subscribe());

    let blocker = executor
        .submit(sh("echo ready; exec sleep 30").description("blocker"))
        .expect("submit blocker");
    events.wait(|e| {
        e.task_id == blocker && matches!(&e.kind, TaskEventKind::Progress { text } if text == "ready")
    });

    let queued = executor
        .submit_tracked(sh("echo never").description("queued"))
        .expect("submit queued");
    let queued_id = queued.id();
    assert_eq!(
        executor.list_running_descriptions(),
        vec!["blocker".to_string(), "queued".to_string()]
    );
    assert_eq!(executor.pending_len(), 1);

    assert!(executor.cancel(queued_id));
    assert!(!executor.is_running(queued_id));
    assert!(!executor.cancel(queued_id));
    assert_eq!(executor.pending_len(), 0);

    let seen = events.task(queued_id);
    assert_eq!(seen.len(), 1, "queued task must only be cancelled: {seen:?}");
    assert!(matches!(seen[0].kind, TaskEventKind::Cancelled));
    assert!(matches!(
        queued.wait_blocking(),
        Err(Error::Cancelled { task_id }) if task_id == queued_id
    ));

    assert!(executor.is_running(blocker));
    assert!(executor.cancel(blocker));
    let seen = events.task(blocker);
    assert!(matches!(terminal_kind(&seen), TaskEventKind::Cancelled));
}

#[test]
fn cancelling_a_running_task_kills_it() {
    let Some(executor) = start_with_env_helper() else {
        return;
    };
    let mut events = Events::new(executor.subscribe());

    let handle = executor
        .submit_tracked(sh("echo $$; exec sleep 30"))
        .expect("submit");
    let id = handle.id();

    let pid = match events.wait(|e| {
        e.task_id == id && matches!(e.kind, TaskEventKind::Progress { .. })
    })
    .kind
    {
        TaskEventKind::Progress { text } => text.parse::<u32>().expect("pid"),
        other => panic!("unexpected event: {other:?}"),
    };

    let started = Instant::now();
    assert!(executor.is_running(id));
    assert!(executor.cancel(id));

    let seen = events.task(id);
    assert!(matches!(terminal_kind(&seen), TaskEventKind::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(handle.wait_blocking(), Err(Error::Cancelled { .. })));
    assert!(process_gone(pid), "process {pid} still exists after cancel");
    assert!(!executor.is_running(id));
    assert!(!executor.cancel(id));
}

#[test]
fn non_zero_exit_is_reported_as_failure_with_output() {
    let Some(executor) = start_with_env_helper() else {
        return;
    };

    let err = executor
        .run_blocking(sh("echo boom >&2; exit 3"))
        .expect_err("exit 3 must fail");
    let Error::NonZeroExit {
        command,
        exit_code,
        output,
        ..
    } = err
    else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(command, "sh");
    assert_eq!(exit_code, Some(3));
    assert!(output.contains("boom"));
}

#[test]
fn missing_helper_binary_is_a_launch_failure() {
    let executor = start(PrivilegeSource::Program {
        method: PrivilegeMethod::Pkexec,
        program: "/nonexistent/privexec-helper".into(),
    });
    let mut events = Events::new(executor.subscribe());

    let id = executor.submit(sh("echo unreachable")).expect("submit");
    let seen = events.task(id);
    assert_eq!(seen.len(), 1, "no Started before a launch failure: {seen:?}");
    let TaskEventKind::Failed { error } = terminal_kind(&seen) else {
        panic!("expected Failed: {seen:?}");
    };
    assert!(matches!(error, Error::LaunchFailure { .. }), "{error:?}");

    // The queue keeps going after a failure.
    let id = executor.submit(sh("echo again")).expect("submit");
    let seen = events.task(id);
    assert!(matches!(terminal_kind(&seen), TaskEventKind::Failed { .. }));
}

#[test]
fn without_privilege_method_tasks_fail_without_spawning() {
    let executor = start(PrivilegeSource::Fixed(PrivilegeMethod::None));

    let err = executor
        .run_blocking(sh("echo unreachable"))
        .expect_err("no helper");
    assert!(matches!(err, Error::NoPrivilegeMethod), "{err:?}");
}

#[test]
fn cancel_all_clears_running_and_queued_tasks() {
    let Some(executor) = start_with_env_helper() else {
        return;
    };
    let mut events = Events::new(executor.subscribe());

    let running = executor
        .submit(sh("echo ready; exec sleep 30"))
        .expect("submit running");
    events.wait(|e| {
        e.task_id == running && matches!(e.kind, TaskEventKind::Progress { .. })
    });
    let queued: Vec<TaskId> = (0..3)
        .map(|_| executor.submit(sh("echo never")).expect("submit queued"))
        .collect();

    executor.cancel_all();

    for id in std::iter::once(running).chain(queued.iter().copied()) {
        let seen = events.task(id);
        assert!(matches!(terminal_kind(&seen), TaskEventKind::Cancelled), "{seen:?}");
        if id != running {
            assert_eq!(seen.len(), 1);
        }
    }
    assert!(executor.list_running_descriptions().is_empty());

    // Still usable afterwards.
    let output = executor.run_blocking(sh("echo after")).expect("run after");
    assert_eq!(output.output.trim(), "after");
}

#[test]
fn run_resolves_with_output() {
    let Some(executor) = start_with_env_helper() else {
        return;
    };

    let output = block_on(executor.run(sh("printf 'a\\nb\\n'"))).expect("run");
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.output, "a\nb\n");
}

#[test]
fn output_beyond_the_limit_is_truncated() {
    let Some(privilege) = env_helper() else {
        return;
    };
    let mut opts = ExecutorOptions::default();
    opts.privilege = privilege;
    opts.output_max_bytes = 16;
    let executor = Executor::start_with(opts).expect("start executor");

    let output = executor
        .run_blocking(sh("printf '%064d' 0"))
        .expect("run");
    assert_eq!(output.output.len(), 16);
    assert!(output.truncated);
}

#[test]
fn shutdown_rejects_new_work_and_cancels_pending() {
    let Some(executor) = start_with_env_helper() else {
        return;
    };
    let mut events = Events::new(executor.subscribe());

    let running = executor
        .submit(sh("echo ready; exec sleep 30"))
        .expect("submit running");
    events.wait(|e| {
        e.task_id == running && matches!(e.kind, TaskEventKind::Progress { .. })
    });
    let queued = executor.submit(sh("echo never")).expect("submit queued");

    executor.shutdown();

    for id in [running, queued] {
        let seen = events.task(id);
        assert!(matches!(terminal_kind(&seen), TaskEventKind::Cancelled), "{seen:?}");
    }
    assert!(matches!(
        executor.submit(sh("echo late")),
        Err(Error::Shutdown)
    ));
}

#[test]
fn system_file_write_and_delete() {
    let Some(privilege) = env_helper() else {
        return;
    };
    let dir = tempfile::tempdir().expect("tempdir");
    let mut opts = ExecutorOptions::default();
    opts.privilege = privilege;
    opts.staging_dir = Some(dir.path().join("staging"));
    std::fs::create_dir(dir.path().join("staging")).expect("create staging dir");
    let executor = Executor::start_with(opts).expect("start executor");
    let mut events = Events::new(executor.subscribe());

    let target = dir.path().join("hosts.d").join("extra");
    std::fs::create_dir(target.parent().expect("parent")).expect("create target dir");
    let target_str = target.to_str().expect("utf-8 path");

    let id = executor
        .files()
        .write(target_str, b"127.0.0.1 example\n", None)
        .expect("write");
    let seen = events.task(id);
    let TaskEventKind::Started { description } = &seen[0].kind else {
        panic!("expected Started: {seen:?}");
    };
    assert_eq!(description, &format!("Writing system file: {target_str}"));
    assert!(matches!(terminal_kind(&seen), TaskEventKind::Finished { .. }), "{seen:?}");
    assert_eq!(
        std::fs::read_to_string(&target).expect("read target"),
        "127.0.0.1 example\n"
    );

    // The staged copy is removed once the task is done.
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while std::fs::read_dir(dir.path().join("staging"))
        .expect("read staging")
        .next()
        .is_some()
    {
        assert!(Instant::now() < deadline, "staging file not removed");
        std::thread::sleep(Duration::from_millis(10));
    }

    let id = executor
        .files()
        .delete(target_str, None)
        .expect("delete");
    let seen = events.task(id);
    assert!(matches!(terminal_kind(&seen), TaskEventKind::Finished { .. }), "{seen:?}");
    assert!(!target.exists());
}

#[test]
fn convenience_operations_validate_operands() {
    let executor = start(PrivilegeSource::Fixed(PrivilegeMethod::None));

    assert!(matches!(
        executor.packages().install(&[], None),
        Err(Error::InvalidInput { .. })
    ));
    assert!(matches!(
        executor.packages().remove(&["--all"], None),
        Err(Error::InvalidInput { .. })
    ));
    assert!(matches!(
        executor.repositories().enable("", None),
        Err(Error::InvalidInput { .. })
    ));
    assert!(matches!(
        executor.services().restart("../etc", None),
        Err(Error::InvalidInput { .. })
    ));
    assert!(matches!(
        executor.files().write("relative/path", b"x", None),
        Err(Error::InvalidInput { .. })
    ));
    assert!(matches!(
        executor.files().delete("/", None),
        Err(Error::InvalidInput { .. })
    ));
    assert!(matches!(
        executor.submit(TaskRequest::new("", Vec::<String>::new())),
        Err(Error::InvalidInput { .. })
    ));
}

#[test]
fn convenience_operations_use_configured_managers() {
    let Some(privilege) = env_helper() else {
        return;
    };
    // `echo` plays the package and service manager so the resulting command line shows up as
    // output.
    let mut opts = ExecutorOptions::default();
    opts.privilege = privilege;
    opts.package_manager = "echo".to_string();
    opts.service_manager = "echo".to_string();
    let executor = Executor::start_with(opts).expect("start executor");
    let mut events = Events::new(executor.subscribe());

    let cases: Vec<(TaskId, &str, &str)> = vec![
        (
            executor.packages().install(&["vim", "git"], None).expect("install"),
            "Installing packages: vim git",
            "install -y vim git",
        ),
        (
            executor.packages().update(&[], None).expect("update"),
            "Updating all packages",
            "update -y",
        ),
        (
            executor.repositories().disable("updates-testing", None).expect("disable"),
            "Disabling repository: updates-testing",
            "config-manager --disable updates-testing",
        ),
        (
            executor
                .repositories()
                .add("https://example.com/x.repo", "Example", None)
                .expect("add"),
            "Adding repository: Example",
            "config-manager --add-repo https://example.com/x.repo",
        ),
        (
            executor.services().restart("sshd", None).expect("restart"),
            "Restarting service: sshd",
            "restart sshd.service",
        ),
    ];

    for (id, description, printed) in cases {
        let seen = events.task(id);
        assert!(
            matches!(&seen[0].kind, TaskEventKind::Started { description: d } if d == description),
            "{seen:?}"
        );
        let TaskEventKind::Finished { output } = terminal_kind(&seen) else {
            panic!("expected Finished: {seen:?}");
        };
        assert_eq!(output.output.trim(), printed);
    }
}
