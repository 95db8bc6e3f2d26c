// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Subprocess supervision.
//!
//! Children are spawned into their own process group and watched from a
//! detached thread; the thread's only job is to wait for the exit and
//! push a [`Wakeup`] back to the event loop. Exit callbacks run on the
//! loop's thread like any other posted work.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::rc::Rc;
use std::thread;

use log::{debug, error};

use crate::engine::Engine;
use crate::event::Wakeup;

/// Exit code reported when the child could not be spawned at all
pub const SPAWN_FAILURE: i32 = 127;

/// Where a child's stdin/stdout/stderr are connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pipe {
    /// Share the supervisor's terminal (interactive stages)
    Inherit,
    /// Capture output for the exit callback
    Capture,
    /// Append output to the given log file
    Log(PathBuf),
}

/// A fully composed subprocess invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub program: String,
    pub args: Vec<String>,
    pub pipe: Pipe,
}

impl Request {
    pub fn new(program: impl Into<String>, args: Vec<String>, pipe: Pipe) -> Self {
        Self {
            program: program.into(),
            args,
            pipe,
        }
    }

    /// Re-root the invocation when a chroot prefix is configured
    pub fn chrooted(self, chroot: &str) -> Self {
        if chroot.is_empty() {
            return self;
        }

        let mut args = vec![chroot.to_owned(), self.program];
        args.extend(self.args);

        Self {
            program: "chroot".into(),
            args,
            pipe: self.pipe,
        }
    }

    /// The invocation as a single printable command line
    pub fn cmdline(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(char::is_whitespace) {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Synthetic result returned by a scripted spawner
#[derive(Debug, Clone, Default)]
pub struct StubExit {
    pub code: i32,
    pub stdout: String,
}

/// How spawn requests are satisfied
#[derive(Clone)]
pub enum Spawner {
    /// Fork and supervise real children
    Host,
    /// Post synthetic successes, optionally printing each command
    DryRun { print: bool },
    /// Scripted outcomes, driven by tests
    Stub(Rc<dyn Fn(&Request) -> StubExit>),
}

/// Exit information delivered to the spawn callback
#[derive(Debug, Clone)]
pub struct Exit {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Exit {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    fn clean() -> Self {
        Self {
            code: 0,
            stdout: vec![],
            stderr: vec![],
        }
    }
}

pub type ExitFn = Box<dyn FnOnce(&mut Engine, Exit) + 'static>;

/// Tracks live children and the callbacks awaiting them
#[derive(Default)]
pub struct Supervisor {
    table: HashMap<i32, ExitFn>,
    /// Commands issued so far, recorded for dry runs and tests
    pub spawned: Vec<Request>,
}

impl Supervisor {
    pub fn active(&self) -> usize {
        self.table.len()
    }
}

/// Spawn a subprocess, invoking `on_exit` from the event loop once it
/// terminates. Returns the child pid, or `None` when no real process
/// was forked (dry runs, scripted runs, spawn failures).
pub fn spawn(
    engine: &mut Engine,
    request: Request,
    on_exit: impl FnOnce(&mut Engine, Exit) + 'static,
) -> Option<i32> {
    engine.procs.spawned.push(request.clone());

    match engine.spawner.clone() {
        Spawner::DryRun { print } => {
            if print {
                println!("{}", request.cmdline());
            }
            let exit = Exit::clean();
            engine.events.post(move |e| on_exit(e, exit));
            None
        }
        Spawner::Stub(script) => {
            let scripted = script(&request);
            let exit = Exit {
                code: scripted.code,
                stdout: scripted.stdout.into_bytes(),
                stderr: vec![],
            };
            engine.events.post(move |e| on_exit(e, exit));
            None
        }
        Spawner::Host => match fork(engine, &request) {
            Ok(pid) => {
                engine.procs.table.insert(pid, Box::new(on_exit));
                Some(pid)
            }
            Err(err) => {
                error!("spawn '{}' failed: {err}", request.cmdline());
                let exit = Exit {
                    code: SPAWN_FAILURE,
                    stdout: vec![],
                    stderr: err.to_string().into_bytes(),
                };
                engine.events.post(move |e| on_exit(e, exit));
                None
            }
        },
    }
}

/// Deliver a child exit collected by the reactor
pub fn dispatch(engine: &mut Engine, pid: i32, code: i32, stdout: Vec<u8>, stderr: Vec<u8>) {
    let Some(on_exit) = engine.procs.table.remove(&pid) else {
        debug!("exit for unknown pid {pid}");
        return;
    };

    let exit = Exit {
        code,
        stdout,
        stderr,
    };
    engine.events.post(move |e| on_exit(e, exit));
}

fn fork(engine: &mut Engine, request: &Request) -> std::io::Result<i32> {
    let mut command = Command::new(&request.program);
    command.args(&request.args).process_group(0).stdin(Stdio::null());

    let capture = matches!(request.pipe, Pipe::Capture);
    match &request.pipe {
        Pipe::Inherit => {
            command.stdin(Stdio::inherit());
            command.stdout(Stdio::inherit());
            command.stderr(Stdio::inherit());
        }
        Pipe::Capture => {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
        }
        Pipe::Log(path) => {
            let mut file = std::fs::OpenOptions::new().append(true).create(true).open(path)?;
            writeln!(file, "# {}", request.cmdline())?;
            command.stdout(Stdio::from(file.try_clone()?));
            command.stderr(Stdio::from(file));
        }
    }

    let mut child = command.spawn()?;
    let pid = child.id() as i32;
    let waker = engine.events.waker();

    thread::spawn(move || {
        let wakeup = if capture {
            match child.wait_with_output() {
                Ok(output) => Wakeup::ChildExit {
                    pid,
                    code: exit_code(output.status),
                    stdout: output.stdout,
                    stderr: output.stderr,
                },
                Err(_) => Wakeup::ChildExit {
                    pid,
                    code: SPAWN_FAILURE,
                    stdout: vec![],
                    stderr: vec![],
                },
            }
        } else {
            match child.wait() {
                Ok(status) => Wakeup::ChildExit {
                    pid,
                    code: exit_code(status),
                    stdout: vec![],
                    stderr: vec![],
                },
                Err(_) => Wakeup::ChildExit {
                    pid,
                    code: SPAWN_FAILURE,
                    stdout: vec![],
                    stderr: vec![],
                },
            }
        };

        // The receiver only drops once the loop is done with children
        let _ = waker.send(wakeup);
    });

    Ok(pid)
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
