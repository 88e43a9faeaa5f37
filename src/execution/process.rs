//! Process spawning and process-group signalling.
//!
//! Project commands run in their own process group so that stop, pause and
//! resume reach the whole tree the command starts. stdout and stderr share
//! one pipe, so the console sees both streams interleaved in write order.

use std::io;
use std::process::Stdio;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};

/// A freshly spawned project process.
pub struct SpawnedProcess {
    pub child: Child,
    /// Read end of the merged stdout/stderr pipe.
    pub output: pipe::Receiver,
    pub stdin: ChildStdin,
}

/// Spawn `program args..` in `working_dir` as a process group leader with
/// stderr merged into stdout.
///
/// Fails if the binary cannot be executed or the directory does not exist.
pub fn spawn_merged(working_dir: &str, program: &str, args: &[String]) -> io::Result<SpawnedProcess> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    let stderr_end = write_end.try_clone()?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(write_end))
        .stderr(Stdio::from(stderr_end))
        .process_group(0)
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;
    // The command still owns our copies of the write end; EOF only arrives
    // once every copy is closed.
    drop(cmd);

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("Failed to take stdin pipe"))?;
    let output = pipe::Receiver::from_owned_fd(read_end)?;

    Ok(SpawnedProcess {
        child,
        output,
        stdin,
    })
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Whether the OS still knows `pid`. A zombie counts as alive until reaped.
pub fn is_alive(pid: u32) -> bool {
    to_pid(pid).is_some_and(|p| matches!(kill(p, None), Ok(()) | Err(Errno::EPERM)))
}

/// Send `signal` to the process group led by `pgid`.
pub fn signal_group(pgid: u32, signal: Signal) -> Result<(), Errno> {
    let pgid = to_pid(pgid).ok_or(Errno::ESRCH)?;
    killpg(pgid, signal)
}
