//! Thin wrapper around `std::process::Command` for running an
//! external program in a given directory with both outputs captured.

use std::{
    io::{self, Write},
    path::Path,
    process::{Command, ExitStatus, Stdio},
};

/// Captured result of a finished process.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

fn command_with_settings<A: AsRef<str>>(
    in_directory: &Path,
    cmd: &str,
    arguments: &[A],
    set_env: &[(&str, &str)],
) -> Command {
    let mut c = Command::new(cmd);
    c.args(arguments.iter().map(|a| a.as_ref()))
        .current_dir(in_directory);
    for (k, v) in set_env {
        c.env(k, v);
    }
    c
}

/// Run `cmd` with `arguments` in `in_directory`, wait for completion
/// and return status plus both captured outputs. `Command::output`
/// drains stdout and stderr concurrently, so large outputs cannot
/// deadlock on the pipe buffer.
pub fn run_captured<A: AsRef<str>>(
    in_directory: &Path,
    cmd: &str,
    arguments: &[A],
    set_env: &[(&str, &str)],
) -> io::Result<CommandOutput> {
    let output = command_with_settings(in_directory, cmd, arguments, set_env)
        .stdin(Stdio::null())
        .output()?;
    Ok(CommandOutput {
        status: output.status,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Same as `run_captured` but feeds `input` to the child's stdin. The
/// writing happens on a scoped thread while the parent drains the
/// output pipes; writing from the waiting thread could deadlock once
/// both the stdin and stdout pipe buffers are full.
pub fn run_captured_with_input<A: AsRef<str>>(
    in_directory: &Path,
    cmd: &str,
    arguments: &[A],
    set_env: &[(&str, &str)],
    input: &[u8],
) -> io::Result<CommandOutput> {
    let mut child = command_with_settings(in_directory, cmd, arguments, set_env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let mut stdin = child.stdin.take().expect("stdin was requested piped");
    let output = std::thread::scope(|scope| {
        let writer = scope.spawn(move || {
            // A child that stops reading (e.g. usage error) closes the
            // pipe; the resulting BrokenPipe is reported via the exit
            // status instead.
            let _ = stdin.write_all(input);
        });
        let output = child.wait_with_output();
        let _ = writer.join();
        output
    })?;
    Ok(CommandOutput {
        status: output.status,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}
