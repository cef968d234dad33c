use std::fmt;
use std::io;
use std::process::{Command, Stdio};

use crate::output::sanitize_line;

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Attach the caller's terminal instead of capturing output. Used for
    /// steps that may need to ask the operator something (key installation).
    pub interactive: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            interactive: false,
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

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for a in &self.args {
            line.push(' ');
            line.push_str(a);
        }
        line
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, the way a terminal would have shown them.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !out.is_empty() && !self.stderr.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }

    /// Short human summary for error messages: stderr, else stdout, else the status.
    pub fn summary(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return last_lines(stderr, 3);
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return last_lines(stdout, 3);
        }
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..]
        .iter()
        .map(|l| sanitize_line(l))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// The single seam through which every external program is run.
pub trait CommandRunner: Send + Sync {
    /// Run to completion. `Err` means the program could not be started at all;
    /// a non-zero exit is reported through `CommandOutput::code`.
    fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        tracing::debug!(command = %spec, "running command");
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);

        if spec.interactive {
            let status = cmd
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()?;
            return Ok(CommandOutput {
                code: status.code(),
                ..CommandOutput::default()
            });
        }

        // Without a terminal on stdin, tools that would prompt fail fast instead of hanging.
        let out = cmd.stdin(Stdio::null()).output()?;
        let output = CommandOutput {
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        };
        for line in output.combined().lines() {
            let line = sanitize_line(line);
            if !line.is_empty() {
                tracing::trace!(program = %spec.program, "{line}");
            }
        }
        Ok(output)
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    //! Scripted stand-in for [`CommandRunner`] that records every invocation.

    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;

    use super::{CommandOutput, CommandRunner, CommandSpec};

    enum Reply {
        Output(CommandOutput),
        SpawnError,
    }

    struct Rule {
        pattern: String,
        replies: VecDeque<Reply>,
        last: Option<Reply>,
    }

    #[derive(Default)]
    struct State {
        calls: Vec<CommandSpec>,
        rules: Vec<Rule>,
    }

    /// Commands are matched by substring against their full command line; the
    /// first matching rule wins. A rule replays its queued replies in order and
    /// then keeps repeating the last one. Unmatched commands succeed silently.
    #[derive(Default)]
    pub struct ScriptedRunner {
        state: Mutex<State>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, pattern: &str, reply: CommandOutput) -> &Self {
            self.push(pattern, Reply::Output(reply));
            self
        }

        pub fn on_spawn_error(&self, pattern: &str) -> &Self {
            self.push(pattern, Reply::SpawnError);
            self
        }

        fn push(&self, pattern: &str, reply: Reply) {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(rule) = st.rules.iter_mut().find(|r| r.pattern == pattern) {
                rule.replies.push_back(reply);
                return;
            }
            st.rules.push(Rule {
                pattern: pattern.to_string(),
                replies: VecDeque::from([reply]),
                last: None,
            });
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.calls.clone()
        }

        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(CommandSpec::command_line).collect()
        }

        pub fn count_matching(&self, pattern: &str) -> usize {
            self.command_lines()
                .iter()
                .filter(|l| l.contains(pattern))
                .count()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.calls.push(spec.clone());
            let line = spec.command_line();
            let Some(rule) = st.rules.iter_mut().find(|r| line.contains(&r.pattern)) else {
                return Ok(CommandOutput::ok(""));
            };
            if let Some(next) = rule.replies.pop_front() {
                rule.last = Some(next);
            }
            match &rule.last {
                Some(Reply::Output(out)) => Ok(out.clone()),
                Some(Reply::SpawnError) => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{}: not found", spec.program),
                )),
                None => Ok(CommandOutput::ok("")),
            }
        }
    }
}
