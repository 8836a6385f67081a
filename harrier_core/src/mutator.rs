use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Poll step while waiting for the mutation provider to exit.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Produces one mutated input per request. Mutation must never fail the
/// fuzzing loop: implementations fall back to the seed on any provider fault.
pub trait Mutator: Send {
    fn mutate(&mut self, seed: &str) -> String;
}

/// The no-provider mutator: returns every seed unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMutator;

impl Mutator for IdentityMutator {
    fn mutate(&mut self, seed: &str) -> String {
        seed.to_string()
    }
}

/// Delegates mutation to an external executable: the seed goes to the
/// provider's stdin, the mutated text is read from its stdout, bounded by a
/// wall-clock timeout and a maximum output size.
///
/// Any fault yields the original seed: spawn failure, timeout, non-zero
/// exit, oversized output, non-UTF-8 output, or empty output.
pub struct SubprocessMutator {
    command: Vec<String>,
    max_output_bytes: usize,
    timeout: Duration,
}

impl SubprocessMutator {
    pub fn new(command: Vec<String>, max_output_bytes: usize, timeout: Duration) -> Self {
        Self {
            command,
            max_output_bytes,
            timeout,
        }
    }

    fn run_provider(&self, seed: &str) -> Option<String> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                eprintln!(
                    "Warning: failed to spawn mutation provider {:?}: {e}",
                    self.command
                );
                return None;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            // A provider may exit without reading its stdin; a broken pipe
            // here is not a mutation fault by itself.
            let _ = stdin.write_all(seed.as_bytes());
        }

        let stdout = child.stdout.take()?;
        let read_limit = self.max_output_bytes as u64 + 1;
        let reader = thread::spawn(move || {
            let mut buffer = Vec::new();
            let ok = stdout.take(read_limit).read_to_end(&mut buffer).is_ok();
            (ok, buffer)
        });

        let started = Instant::now();
        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() > self.timeout {
                        eprintln!("Warning: mutation provider timed out, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = reader.join();
                        return None;
                    }
                    thread::sleep(CHILD_POLL_INTERVAL);
                }
                Err(e) => {
                    eprintln!("Warning: error waiting for mutation provider: {e}");
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = reader.join();
                    return None;
                }
            }
        };

        let (read_ok, output) = reader.join().ok()?;
        if !exit_status.success() || !read_ok {
            return None;
        }
        if output.len() > self.max_output_bytes {
            eprintln!(
                "Warning: mutation provider output exceeded {} bytes, discarding",
                self.max_output_bytes
            );
            return None;
        }
        let text = String::from_utf8(output).ok()?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

impl Mutator for SubprocessMutator {
    fn mutate(&mut self, seed: &str) -> String {
        if self.command.is_empty() {
            return seed.to_string();
        }
        self.run_provider(seed).unwrap_or_else(|| seed.to_string())
    }
}
