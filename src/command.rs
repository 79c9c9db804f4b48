use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::process::Command;

/// Get environment suitable for spawning nix commands.
///
/// Removes TMPDIR to let nix/bash use the system default (/tmp).
/// An inherited TMPDIR may point at a directory created by a parent
/// shell that gets cleaned up unexpectedly.
pub fn clean_env() -> HashMap<String, String> {
    let mut env_map: HashMap<String, String> = env::vars().collect();
    env_map.remove("TMPDIR");
    env_map
}

/// Wrapper around a nix tool invocation.
///
/// Pins the experimental-features flags and spawns with a cleaned
/// environment; every run is logged at debug level.
pub struct NixCommand {
    cmd: Command,
}

impl NixCommand {
    pub fn new(program: &str) -> Self {
        let mut cmd = Command::new(program);
        cmd.args(["--extra-experimental-features", "flakes nix-command"]);
        cmd.env_clear();
        cmd.envs(clean_env());
        Self { cmd }
    }

    pub fn arg<S: AsRef<std::ffi::OsStr>>(&mut self, arg: S) -> &mut Self {
        self.cmd.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.cmd.args(args);
        self
    }

    pub fn current_dir(&mut self, dir: &Path) -> &mut Self {
        self.cmd.current_dir(dir);
        self
    }

    pub fn run(&mut self) -> Result<()> {
        tracing::debug!("+ {}", self.format_command());

        let status = self
            .cmd
            .status()
            .context(format!("Failed to run {}", self.get_program()))?;
        if !status.success() {
            anyhow::bail!(
                "Command failed with exit code: {}",
                status.code().unwrap_or(1)
            );
        }
        Ok(())
    }

    pub fn output(&mut self) -> Result<String> {
        tracing::debug!("+ {}", self.format_command());

        let output = self
            .cmd
            .output()
            .context(format!("Failed to run {}", self.get_program()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Command failed:\n{}", stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim().to_string())
    }

    pub fn json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let output = self.output()?;
        serde_json::from_str(&output).context("Failed to parse JSON output")
    }

    /// Run the command, reporting only whether it exited successfully.
    /// Used for probes like path-validity checks where failure is an answer,
    /// not an error.
    pub fn succeeds(&mut self) -> bool {
        tracing::trace!("+ {}", self.format_command());
        self.cmd
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn get_program(&self) -> String {
        self.cmd.get_program().to_string_lossy().to_string()
    }

    fn format_command(&self) -> String {
        let program = self.get_program();
        let args: Vec<_> = self.cmd.get_args().map(|a| a.to_string_lossy()).collect();
        format!("{} {}", program, args.join(" "))
    }
}
