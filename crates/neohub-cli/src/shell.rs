use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to spawn /bin/sh: {0}")]
    Spawn(#[from] io::Error),
    #[error("`{command}` failed ({status}): {stderr}")]
    Exit {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("`{command}` printed nothing")]
    Empty { command: String },
}

/// Runs `command` through `/bin/sh -c` with the caller's environment and returns trimmed stdout.
pub fn run(command: &str) -> Result<String, ShellError> {
    let output = Command::new("/bin/sh").arg("-c").arg(command).output()?;
    if !output.status.success() {
        return Err(ShellError::Exit {
            command: command.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn find_binary(name: &str) -> Result<PathBuf, ShellError> {
    let command = format!("command -v {name}");
    let found = run(&command)?;
    if found.is_empty() {
        return Err(ShellError::Empty { command });
    }
    Ok(PathBuf::from(found))
}
