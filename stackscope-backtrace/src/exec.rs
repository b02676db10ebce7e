//! Helper-process plumbing for the external symbolisers.
//!
//! Every external tool call goes through [`run`], which imposes a deadline:
//! a wedged `addr2line` or `nm` must never hang a capture. On expiry the
//! child is killed and the call reports failure.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Deadline for symbol-listing runs over the whole executable.
pub const LIST_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for single-address symboliser queries.
pub const QUERY_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub status: i32,
}

/// Runs `cmd`, capturing stdout, killing the child at `deadline`.
pub fn run(cmd: &mut Command, deadline: Duration) -> std::io::Result<ExecOutput> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    wait_with_deadline(child, deadline)
}

/// Runs `first | second`, capturing the second command's stdout.
pub fn run_piped(
    first: &mut Command,
    second: &mut Command,
    deadline: Duration,
) -> std::io::Result<ExecOutput> {
    let mut producer = first
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let stdout = producer
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("missing child stdout"))?;
    let consumer = second
        .stdin(Stdio::from(stdout))
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();
    let consumer = match consumer {
        Ok(child) => child,
        Err(err) => {
            let _ = producer.kill();
            let _ = producer.wait();
            return Err(err);
        }
    };
    let output = wait_with_deadline(consumer, deadline);
    let _ = producer.wait();
    output
}

fn wait_with_deadline(mut child: Child, deadline: Duration) -> std::io::Result<ExecOutput> {
    let started = Instant::now();
    // Drain stdout first: the child can fill the pipe and stall before
    // exiting if nobody reads.
    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        let reader = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        });
        loop {
            if let Some(status) = child.try_wait()? {
                stdout = reader.join().unwrap_or_default();
                return Ok(ExecOutput {
                    stdout,
                    status: status.code().unwrap_or(-1),
                });
            }
            if started.elapsed() > deadline {
                let _ = child.kill();
                let _ = child.wait();
                let _ = reader.join();
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "helper process deadline expired",
                ));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    let status = child.wait()?;
    Ok(ExecOutput {
        stdout,
        status: status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn captures_stdout_and_status() {
        let out = run(
            Command::new("sh").args(["-c", "echo hello; exit 3"]),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.status, 3);
    }

    #[cfg(unix)]
    #[test]
    fn deadline_kills_wedged_child() {
        let err = run(
            Command::new("sh").args(["-c", "sleep 30"]),
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[cfg(unix)]
    #[test]
    fn pipeline_feeds_second_command() {
        let out = run_piped(
            Command::new("sh").args(["-c", "printf 'b\\na\\n'"]),
            &mut Command::new("sort"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.stdout, "a\nb\n");
    }
}
