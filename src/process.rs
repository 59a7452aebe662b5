//! Child processes whose combined output is consumed line by line.
//!
//! Both the compose lifecycle commands and the package upgrade relay every
//! line of their subprocess as soon as it is flushed, so callers can tail the
//! operation live. A [`LineRelay`] owns its child: dropping it kills the
//! process, which is how a consumer that stops pulling cancels the work.

use std::{
    ffi::OsStr,
    process::{ExitStatus, Stdio},
};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Split};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to invoke {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error while reading the output of {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Exit { program: String, status: ExitStatus },
}

/// Describes a command without spawning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.envs.push((key.into(), val.into()));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Run to completion, discarding the output.
    pub async fn status(&self) -> Result<(), ProcessError> {
        let status = self
            .command()
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| ProcessError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        self.check(status)
    }

    /// Run to completion and capture stdout.
    pub async fn output(&self) -> Result<String, ProcessError> {
        let output = self
            .command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ProcessError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.stderr.is_empty() {
            log::debug!(
                "{} stderr: {}",
                self.program,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }
        self.check(output.status)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Spawn with stdout and stderr piped into a [`LineRelay`].
    pub fn spawn_lines(&self) -> Result<LineRelay, ProcessError> {
        let mut child = self
            .command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        log::debug!("Spawned {} {:?}", self.program, self.args);

        let stdout = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
        let stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));
        Ok(LineRelay {
            program: self.program.clone(),
            child,
            stdout,
            stderr,
        })
    }

    fn check(&self, status: ExitStatus) -> Result<(), ProcessError> {
        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::Exit {
                program: self.program.clone(),
                status,
            })
        }
    }
}

/// Running child process whose stdout and stderr are merged into a single
/// sequence of lines.
#[derive(Debug)]
pub struct LineRelay {
    program: String,
    child: Child,
    stdout: Option<Split<BufReader<ChildStdout>>>,
    stderr: Option<Split<BufReader<ChildStderr>>>,
}

enum Pipe {
    Stdout,
    Stderr,
}

/// Output is not required to be UTF-8. Invalid sequences are replaced.
async fn read_line<R>(segments: Option<&mut Split<R>>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(segments) = segments else {
        return Ok(None);
    };
    Ok(segments.next_segment().await?.map(|mut bytes| {
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }))
}

impl LineRelay {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next line from either pipe, in the order they are flushed. `None` once
    /// both pipes are closed.
    pub async fn next_line(&mut self) -> Result<Option<String>, ProcessError> {
        loop {
            if self.stdout.is_none() && self.stderr.is_none() {
                return Ok(None);
            }

            let (pipe, line) = tokio::select! {
                line = read_line(self.stdout.as_mut()), if self.stdout.is_some() => (Pipe::Stdout, line),
                line = read_line(self.stderr.as_mut()), if self.stderr.is_some() => (Pipe::Stderr, line),
            };

            match line {
                Ok(Some(line)) => return Ok(Some(line)),
                Ok(None) => match pipe {
                    Pipe::Stdout => self.stdout = None,
                    Pipe::Stderr => self.stderr = None,
                },
                Err(source) => {
                    return Err(ProcessError::Io {
                        program: self.program.clone(),
                        source,
                    });
                }
            }
        }
    }

    /// Wait for the process to exit. Any output not yet read is discarded.
    pub async fn wait(mut self) -> Result<(), ProcessError> {
        self.stdout = None;
        self.stderr = None;
        let status = self.child.wait().await.map_err(|source| ProcessError::Io {
            program: self.program.clone(),
            source,
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::Exit {
                program: self.program,
                status,
            })
        }
    }
}
