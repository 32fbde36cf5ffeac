//! A tiny PID-stable bridge: optionally blocks on a fifo until `runj
//! start` unblocks it, wires up a pty from a received console-socket
//! fd, then exec(2)s into `jexec(8)` so the process image that attaches
//! to the jail keeps this process's pid across both execs.

use std::env;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::process::{self, Command};

use anyhow::{anyhow, Context, Error};
use nix::pty::openpty;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use nix::sys::uio::IoVec;
use nix::unistd::{close, dup2};

const JEXEC_PATH: &str = "/usr/sbin/jexec";
const CONSOLE_SOCKET_ENV: &str = "__RUNJ_CONSOLE_SOCKET";
const SKIP_FIFO: &str = "-";

fn main() {
    tracing_subscriber::fmt::init();

    match run() {
        Ok(()) => {}
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    }
}

#[fehler::throws]
fn run() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        fehler::throw!(anyhow!(
            "usage: runj-entrypoint JAIL-ID FIFO-PATH PROGRAM [ARGS...]"
        ));
    }

    let jid = &args[1];
    let fifo_path = &args[2];
    let argv = &args[3..];

    setup_console()?;

    if fifo_path != SKIP_FIFO {
        fifo::signal(fifo_path).context("failed to signal exec fifo")?;
    }

    let err = Command::new(JEXEC_PATH).arg(jid).args(argv).exec();
    fehler::throw!(anyhow!("failed to exec jexec: {}", err));
}

#[fehler::throws]
fn setup_console() {
    let socket_fd_arg = match env::var(CONSOLE_SOCKET_ENV) {
        Ok(value) => value,
        Err(_) => return,
    };
    env::remove_var(CONSOLE_SOCKET_ENV);

    let socket_fd: RawFd = socket_fd_arg
        .parse()
        .map_err(|_| anyhow!("console: bad socket fd: {}", socket_fd_arg))?;

    let result = openpty(None, None)?;
    let master = result.master;
    let slave = result.slave;

    send_fd(socket_fd, master)?;
    let _ = close(socket_fd);
    close(master)?;

    dup_stdio(slave)?;
}

/// Sends the pty master fd to the connected peer via `SCM_RIGHTS`.
#[fehler::throws]
fn send_fd(socket_fd: RawFd, fd_to_send: RawFd) {
    let fds = [fd_to_send];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let iov = [IoVec::from_slice(b"x")];

    sendmsg(socket_fd, &iov, &cmsg, MsgFlags::empty(), None)?;
}

/// Dups the pty slave onto fd 0, 1 and 2.
#[fehler::throws]
fn dup_stdio(slave: RawFd) {
    for fd in &[0, 1, 2] {
        dup2(slave, *fd)?;
    }
    if slave > 2 {
        close(slave)?;
    }
}
