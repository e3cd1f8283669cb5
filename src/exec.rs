//! Running the external tools: the unlock tool, the password prompt and
//! cryptsetup. Callers build an [`Invocation`] and hand it to an [`Exec`],
//! which lets tests substitute a recording implementation.

use once_cell::sync::Lazy;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("cannot execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} failed: exit status {status}")]
    Failed { program: String, status: i32 },
    #[error("{program} was terminated by a signal")]
    Signalled { program: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = ExecError> = core::result::Result<T, E>;

static PROGRAM_NAME: Lazy<String> = Lazy::new(|| {
    std::env::args_os()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
});

/// Basename of the running executable. Identifies this process in prompts,
/// temporary key file names and secret cache descriptions.
pub fn program_name() -> &'static str {
    &PROGRAM_NAME
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Zeroizing<Vec<u8>>>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, data: &[u8]) -> Self {
        self.stdin = Some(Zeroizing::new(data.to_vec()));
        self
    }

    /// The program followed by its arguments, as a shell would see them.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Completed {
    pub program: String,
    /// `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: Zeroizing<Vec<u8>>,
}

impl Completed {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn check(self) -> Result<Self> {
        match self.status {
            Some(0) => Ok(self),
            Some(status) => Err(ExecError::Failed {
                program: self.program.clone(),
                status,
            }),
            None => Err(ExecError::Signalled {
                program: self.program.clone(),
            }),
        }
    }

    /// The first line of standard output, without its terminator.
    pub fn first_line(&self) -> Zeroizing<String> {
        let line = self.stdout.split(|b| *b == b'\n').next().unwrap_or_default();
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Zeroizing::new(String::from_utf8_lossy(line).into_owned())
    }
}

pub trait Exec {
    /// Runs `invocation` to completion. A process that starts and exits
    /// unsuccessfully is not an error here; see [`Completed::check`].
    fn run(&mut self, invocation: &Invocation) -> Result<Completed>;
}

impl<T: Exec + ?Sized> Exec for &mut T {
    fn run(&mut self, invocation: &Invocation) -> Result<Completed> {
        (**self).run(invocation)
    }
}

/// Runs tools as child processes. Standard error is inherited so that tool
/// diagnostics reach the console or journal.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExec;

impl Exec for SystemExec {
    fn run(&mut self, invocation: &Invocation) -> Result<Completed> {
        log::debug!("executing {}", invocation.program);
        let stdin = match invocation.stdin {
            Some(_) => Stdio::piped(),
            None => Stdio::null(),
        };
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        if let (Some(data), Some(mut pipe)) = (&invocation.stdin, child.stdin.take()) {
            pipe.write_all(data)?;
        }
        let output = child.wait_with_output()?;
        Ok(Completed {
            program: invocation.program.clone(),
            status: output.status.code(),
            stdout: Zeroizing::new(output.stdout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn completed(status: Option<i32>, stdout: &[u8]) -> Completed {
        Completed {
            program: "/usr/bin/tool".to_string(),
            status,
            stdout: Zeroizing::new(stdout.to_vec()),
        }
    }

    #[test]
    fn failure_names_program_and_status() {
        let err = completed(Some(1), b"").check().err().map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("/usr/bin/tool failed: exit status 1"));
        let err = completed(None, b"").check().err().map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("/usr/bin/tool was terminated by a signal"));
        assert!(completed(Some(0), b"").check().is_ok());
    }

    #[test]
    fn first_line_only() {
        assert_eq!(completed(Some(0), b"1234\r\nrest\n").first_line().as_str(), "1234");
        assert_eq!(completed(Some(0), b"").first_line().as_str(), "");
    }

    #[test]
    fn argv_starts_with_program() {
        let invocation = Invocation::new("cryptsetup").arg("config").args(["--priority", "prefer"]);
        assert_eq!(invocation.argv(), vec!["cryptsetup", "config", "--priority", "prefer"]);
    }

    #[cfg(unix)]
    #[test]
    fn system_exec_feeds_stdin() -> Result<()> {
        let invocation = Invocation::new("cat").stdin(b"secret\n");
        let completed = SystemExec.run(&invocation)?.check()?;
        assert_eq!(completed.first_line().as_str(), "secret");

        let err = SystemExec.run(&Invocation::new("false"))?.check().err();
        assert!(matches!(err, Some(ExecError::Failed { status: 1, .. })));
        Ok(())
    }
}
