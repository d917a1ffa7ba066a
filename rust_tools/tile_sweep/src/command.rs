use log::debug;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Substitute `{key}` placeholders in each argument.
pub fn expand_args(args: &[String], vars: &[(&str, String)]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), value)
            })
        })
        .collect()
}

#[derive(Debug)]
pub enum CommandOutcome {
    Exited { status: ExitStatus, stderr: String },
    TimedOut,
}

/// Run `program` to completion, killing it once `timeout` elapses.
///
/// Stdout is discarded; stderr is captured after exit for error reporting.
pub fn run_with_timeout(
    program: &str,
    args: &[String],
    timeout: Option<Duration>,
) -> std::io::Result<CommandOutcome> {
    debug!("Running {} {:?}", program, args);
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    // Own process group, so a timeout also reaches anything the program spawned
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = command.spawn()?;

    // Drain stderr on a side thread so a chatty child cannot block on a full pipe
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    });

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                kill_tree(&mut child);
                break None;
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    let Some(status) = status else {
        // A surviving descendant may still hold stderr open. Leave the reader
        // thread detached rather than wait for EOF.
        return Ok(CommandOutcome::TimedOut);
    };
    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    Ok(CommandOutcome::Exited {
        status,
        stderr: stderr.trim().to_string(),
    })
}

/// Kill the child's whole process group, then the child itself, and reap it.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => debug!("kill {} exited with {}", group, status),
            Err(e) => debug!("Could not signal process group {}: {}", group, e),
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}
