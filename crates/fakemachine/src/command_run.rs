//! Helpers for running host tools and collecting their output.

use std::process::{Command, Stdio};

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::trace;

/// Extension helpers for [`std::process::Command`].
pub(crate) trait CommandRun {
    /// Run the command to completion, failing on a non-zero exit status.
    /// The tail of stderr is folded into the error message.
    fn run(&mut self) -> Result<()>;

    /// Run the command and capture stdout as a string, failing on a
    /// non-zero exit status.
    fn run_get_string(&mut self) -> Result<String>;
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        checked_output(self)?;
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let output = checked_output(self)?;
        String::from_utf8(output).context("command output was not valid UTF-8")
    }
}

fn checked_output(cmd: &mut Command) -> Result<Vec<u8>> {
    trace!("exec: {cmd:?}");
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to execute {:?}", cmd.get_program()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!(
            "{:?} failed ({}): {}",
            cmd.get_program(),
            output.status,
            stderr.trim_end()
        ));
    }
    Ok(output.stdout)
}
