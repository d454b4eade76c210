//! The worker pool: a fixed set of executors that receive work items over
//! typed channels, run shell commands, capture output, and report back.
//! Workers know nothing of the build graph; the planner owns all state.

use crate::graph::ActionId;
use crate::signal;
use anyhow::bail;
use std::sync::mpsc;

/// Planner -> worker: one action to execute.  `targets` carries the
/// `|`-joined output paths so the worker can delete partial outputs when the
/// command fails.
pub struct WorkItem {
    pub id: ActionId,
    pub name: String,
    pub command: String,
    pub targets: String,
    /// Test runs get a fresh scratch directory afterwards.
    pub is_test: bool,
}

enum ToWorker {
    Work(WorkItem),
    Shutdown,
}

#[derive(PartialEq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// Worker -> planner: a completed work item.
pub struct Finished {
    pub worker: usize,
    pub id: ActionId,
    pub name: String,
    pub termination: Termination,
    pub output: Vec<u8>,
}

struct Worker {
    send: mpsc::Sender<ToWorker>,
    busy: bool,
    thread: Option<std::thread::JoinHandle<()>>,
}

pub struct Pool {
    workers: Vec<Worker>,
    finished: mpsc::Receiver<Finished>,
    running: usize,
}

impl Pool {
    pub fn new(count: usize) -> anyhow::Result<Pool> {
        let count = count.max(1);
        let (finished_send, finished) = mpsc::channel();
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let (send, recv) = mpsc::channel();
            let results = finished_send.clone();
            let thread = std::thread::spawn(move || worker_main(i, recv, results));
            workers.push(Worker {
                send,
                busy: false,
                thread: Some(thread),
            });
        }
        Ok(Pool {
            workers,
            finished,
            running: 0,
        })
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.workers.len()
    }

    pub fn dispatch(&mut self, item: WorkItem) -> anyhow::Result<()> {
        let worker = match self.workers.iter_mut().find(|w| !w.busy) {
            Some(w) => w,
            None => bail!("dispatch with no idle worker"),
        };
        worker.busy = true;
        // Send only fails if the worker died, which is itself fatal.
        if worker.send.send(ToWorker::Work(item)).is_err() {
            bail!("worker channel closed");
        }
        self.running += 1;
        Ok(())
    }

    /// Block until some worker completes its action.
    pub fn wait(&mut self) -> anyhow::Result<Finished> {
        let fin = match self.finished.recv() {
            Ok(fin) => fin,
            Err(_) => bail!("all workers terminated unexpectedly"),
        };
        self.workers[fin.worker].busy = false;
        self.running -= 1;
        Ok(fin)
    }

    /// Send every worker its shutdown sentinel and reap the threads.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            let _ = worker.send.send(ToWorker::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn worker_main(id: usize, recv: mpsc::Receiver<ToWorker>, results: mpsc::Sender<Finished>) {
    let scratch = format!("tmp/worker-{}", id);
    let _ = std::fs::create_dir_all(&scratch);
    loop {
        let item = match recv.recv() {
            Ok(ToWorker::Work(item)) => item,
            Ok(ToWorker::Shutdown) | Err(_) => break,
        };

        // Cancellation already under way: fail fast instead of launching.
        let (termination, output) = if signal::interrupted() {
            (Termination::Interrupted, b"interrupted".to_vec())
        } else {
            let command = format!("TMPDIR={} {}", scratch, item.command);
            match run_command(&command) {
                Ok((termination, output)) => (termination, output),
                Err(err) => (Termination::Failure, err.to_string().into_bytes()),
            }
        };

        match termination {
            Termination::Success => {
                if item.is_test {
                    let _ = std::fs::remove_dir_all(&scratch);
                    let _ = std::fs::create_dir_all(&scratch);
                }
            }
            _ => {
                // Partial outputs must never masquerade as fresh.
                for target in item.targets.split('|') {
                    let _ = std::fs::remove_file(target);
                }
            }
        }

        let fin = Finished {
            worker: id,
            id: item.id,
            name: item.name,
            termination,
            output,
        };
        // Failure means the planner went away; nothing left to do.
        if results.send(fin).is_err() {
            break;
        }
    }
}

#[cfg(unix)]
fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret < 0 {
        let err_str = unsafe { std::ffi::CStr::from_ptr(libc::strerror(ret)) };
        bail!("{}: {}", func, err_str.to_str().unwrap());
    }
    Ok(())
}

/// Wraps libc::posix_spawn_file_actions_t, in particular to implement Drop.
#[cfg(unix)]
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

#[cfg(unix)]
impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_posix(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

#[cfg(unix)]
impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// Run a command via `/bin/sh -c` with stdout and stderr merged into one
/// pipe.  Spawned with posix_spawn so both streams share a single pipe,
/// which std::process cannot express.
#[cfg(unix)]
fn run_command(cmdline: &str) -> anyhow::Result<(Termination, Vec<u8>)> {
    use std::io::{Read, Write};
    use std::os::fd::FromRawFd;
    use std::os::unix::process::ExitStatusExt;

    let (pid, mut pipe) = unsafe {
        let mut pipe: [libc::c_int; 2] = std::mem::zeroed();
        check_posix("pipe", libc::pipe(&mut pipe as *mut i32))?;

        let mut actions = PosixSpawnFileActions::new()?;
        // stdout/stderr => pipe
        actions.adddup2(pipe[1], 1)?;
        actions.adddup2(pipe[1], 2)?;
        // close pipe in child
        actions.addclose(pipe[0])?;
        actions.addclose(pipe[1])?;

        let mut pid: libc::pid_t = 0;
        let path = "/bin/sh\0".as_ptr() as *const libc::c_char;
        let cmdline_nul = std::ffi::CString::new(cmdline).unwrap();
        let argv: [*const libc::c_char; 4] = [
            path,
            "-c\0".as_ptr() as *const libc::c_char,
            cmdline_nul.as_ptr(),
            std::ptr::null(),
        ];

        check_posix(
            "posix_spawn",
            libc::posix_spawn(
                &mut pid,
                path,
                actions.as_ptr(),
                std::ptr::null(),
                argv.as_ptr() as *const *mut libc::c_char,
                std::ptr::null(),
            ),
        )?;

        check_posix("close", libc::close(pipe[1]))?;

        (pid, std::fs::File::from_raw_fd(pipe[0]))
    };

    let mut output = Vec::new();
    pipe.read_to_end(&mut output)?;

    let status = unsafe {
        let mut status: i32 = 0;
        check_posix("waitpid", libc::waitpid(pid, &mut status, 0))?;
        std::process::ExitStatus::from_raw(status)
    };

    let mut termination = Termination::Success;
    if !status.success() {
        termination = Termination::Failure;
        if let Some(sig) = status.signal() {
            match sig {
                libc::SIGINT => {
                    write!(output, "interrupted").unwrap();
                    termination = Termination::Interrupted;
                }
                _ => write!(output, "signal {}", sig).unwrap(),
            }
        }
    }

    Ok((termination, output))
}
