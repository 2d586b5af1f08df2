// WG Tunnel Manager - External Process Module
// Runs backend commands; the trait is the seam tests script against

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Short description for diagnostics: exit status plus the first
    /// non-empty output line.
    pub fn summary(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit {}", code),
            None => "terminated by signal".to_string(),
        };
        let detail = self
            .stderr
            .lines()
            .chain(self.stdout.lines())
            .map(str::trim)
            .find(|line| !line.is_empty());
        match detail {
            Some(line) => format!("{}: {}", status, line),
            None => status,
        }
    }

    /// Whether any whitespace-separated token of stdout equals `marker`.
    pub fn stdout_has_token(&self, marker: &str) -> bool {
        self.stdout
            .split_whitespace()
            .any(|token| token.trim_matches(|c: char| c == ':' || c == ',') == marker)
    }
}

/// Launches external programs.
///
/// Spawn failures surface as `io::Error`; a `NotFound` kind means the
/// program does not exist.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the host with no timeout of its own
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        trace!("Running {} {:?}", program, args);
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let output = command.output().await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Expand `{name}` and `{config}` placeholders in an argument template.
pub fn expand_args(template: &[String], name: &str, config: Option<&Path>) -> Vec<String> {
    let config = config.map(|p| p.to_string_lossy().into_owned());
    template
        .iter()
        .map(|arg| {
            let arg = arg.replace("{name}", name);
            match &config {
                Some(path) => arg.replace("{config}", path),
                None => arg,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_expand_args() {
        let template = strings(&["start", "WireGuardTunnel${name}", "{config}"]);
        let expanded = expand_args(&template, "office", Some(Path::new("/tmp/office-1.conf")));
        assert_eq!(
            expanded,
            strings(&["start", "WireGuardTunnel$office", "/tmp/office-1.conf"])
        );

        let no_config = expand_args(&strings(&["down", "{name}"]), "office", None);
        assert_eq!(no_config, strings(&["down", "office"]));
    }

    #[test]
    fn test_summary_prefers_stderr() {
        let output = CommandOutput {
            code: Some(1),
            stdout: "ignored\n".to_string(),
            stderr: "\n  access denied  \n".to_string(),
        };
        assert_eq!(output.summary(), "exit 1: access denied");
        assert_eq!(CommandOutput::default().summary(), "terminated by signal");
    }

    #[test]
    fn test_stdout_has_token() {
        let output = CommandOutput {
            code: Some(0),
            stdout: "        STATE              : 4  RUNNING\n".to_string(),
            stderr: String::new(),
        };
        assert!(output.stdout_has_token("RUNNING"));

        let inactive = CommandOutput {
            code: Some(3),
            stdout: "inactive\n".to_string(),
            stderr: String::new(),
        };
        assert!(!inactive.stdout_has_token("active"));

        let listing = CommandOutput {
            code: Some(0),
            stdout: "5: office: <POINTOPOINT,NOARP,UP> mtu 1420\n".to_string(),
            stderr: String::new(),
        };
        assert!(listing.stdout_has_token("office"));
        assert!(!listing.stdout_has_token("offic"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_reports_missing_program() {
        let err = SystemRunner
            .run("definitely-not-a-real-program-7f3a", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let output = SystemRunner
            .run("sh", &strings(&["-c", "echo hello; exit 3"]))
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
    }
}
