use privexec::{Executor, TaskEventKind};

#[cfg(feature = "rt-async-io")]
fn main() {
    if let Err(e) = smol::block_on(run()) {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}

#[cfg(feature = "rt-tokio")]
fn main() {
    let rt = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("init tokio runtime failed: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run()) {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), privexec::Error> {
    let packages: Vec<String> = std::env::args().skip(1).collect();
    let packages: Vec<&str> = if packages.is_empty() {
        vec!["vim"]
    } else {
        packages.iter().map(String::as_str).collect()
    };

    let executor = Executor::start()?;
    let mut events = executor.subscribe();
    let id = executor.packages().install(&packages, None)?;

    while let Some(event) = events.next().await {
        if event.task_id != id {
            continue;
        }
        match event.kind {
            TaskEventKind::Started { description } => println!("started: {description}"),
            TaskEventKind::Progress { text } => println!("{text}"),
            TaskEventKind::Finished { output } => {
                println!("finished (exit {})", output.exit_code);
                break;
            }
            TaskEventKind::Failed { error } => {
                eprintln!("failed: {error}");
                break;
            }
            TaskEventKind::Cancelled => {
                println!("cancelled");
                break;
            }
            _ => {}
        }
    }

    executor.shutdown();
    Ok(())
}
