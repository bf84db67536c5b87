use std::time::Duration;

use privexec::{Executor, TaskEventKind, TaskRequest};

fn main() {
    let executor = match Executor::start() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("{e:?}");
            std::process::exit(1);
        }
    };
    let mut events = executor.subscribe();

    let request = TaskRequest::new("sleep", ["60"])
        .description("Waiting a minute")
        .timeout(Duration::from_secs(120));
    let id = match executor.submit(request) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("{e:?}");
            std::process::exit(1);
        }
    };

    while let Some(event) = events.next_blocking() {
        if event.task_id != id {
            continue;
        }
        println!("{:?}", event.kind);
        match event.kind {
            TaskEventKind::Started { .. } => {
                std::thread::sleep(Duration::from_secs(1));
                println!("cancel accepted: {}", executor.cancel(id));
            }
            _ if event.is_terminal() => break,
            _ => {}
        }
    }

    executor.shutdown();
}
