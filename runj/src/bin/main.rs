use std::path::PathBuf;
use std::process::exit;

use clap::{App, Arg, SubCommand};
use runj::{KillTarget, ProcessIo, Runtime};

fn main() {
    tracing_subscriber::fmt::init();

    let matches = App::new("runj")
        .about("An OCI-compliant runtime for FreeBSD jails")
        .subcommand(
            SubCommand::with_name("create")
                .arg(Arg::with_name("ID").required(true))
                .arg(Arg::with_name("BUNDLE").required(false))
                .arg(
                    Arg::with_name("bundle")
                        .short("b")
                        .long("bundle")
                        .takes_value(true),
                )
                .arg(Arg::with_name("console-socket").long("console-socket").takes_value(true))
                .arg(Arg::with_name("pid-file").long("pid-file").takes_value(true)),
        )
        .subcommand(SubCommand::with_name("start").arg(Arg::with_name("ID").required(true)))
        .subcommand(SubCommand::with_name("state").arg(Arg::with_name("ID").required(true)))
        .subcommand(
            SubCommand::with_name("kill")
                .arg(Arg::with_name("ID").required(true))
                .arg(Arg::with_name("SIGNAL").required(false))
                .arg(Arg::with_name("all").long("all"))
                .arg(Arg::with_name("pid").long("pid").takes_value(true)),
        )
        .subcommand(SubCommand::with_name("delete").arg(Arg::with_name("ID").required(true)))
        .subcommand(
            SubCommand::with_name("extension").subcommand(
                SubCommand::with_name("exec")
                    .arg(Arg::with_name("ID").required(true))
                    .arg(Arg::with_name("process").long("process").takes_value(true))
                    .arg(Arg::with_name("console-socket").long("console-socket").takes_value(true))
                    .arg(Arg::with_name("CMD").multiple(true)),
            ),
        )
        .get_matches();

    let runtime = Runtime::from_env();
    let code = dispatch(&runtime, &matches);
    exit(code);
}

fn dispatch(runtime: &Runtime, matches: &clap::ArgMatches) -> i32 {
    let result = if let Some(m) = matches.subcommand_matches("create") {
        cmd_create(runtime, m)
    } else if let Some(m) = matches.subcommand_matches("start") {
        runtime.start(m.value_of("ID").unwrap())
    } else if let Some(m) = matches.subcommand_matches("state") {
        return cmd_state(runtime, m);
    } else if let Some(m) = matches.subcommand_matches("kill") {
        cmd_kill(runtime, m)
    } else if let Some(m) = matches.subcommand_matches("delete") {
        runtime.delete(m.value_of("ID").unwrap())
    } else if let Some(m) = matches.subcommand_matches("extension").and_then(|m| m.subcommand_matches("exec")) {
        cmd_exec(runtime, m)
    } else {
        eprintln!("no subcommand given");
        return 1;
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{}", err);
            1
        }
    }
}

fn cmd_create(runtime: &Runtime, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let id = matches.value_of("ID").unwrap();
    let bundle = matches
        .value_of("bundle")
        .or_else(|| matches.value_of("BUNDLE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap());
    let console_socket = matches.value_of("console-socket").map(PathBuf::from);
    let pid_file = matches.value_of("pid-file").map(PathBuf::from);

    runtime.create(
        id,
        bundle,
        console_socket.as_deref(),
        pid_file.as_deref(),
        ProcessIo::default(),
    )
}

fn cmd_state(runtime: &Runtime, matches: &clap::ArgMatches) -> i32 {
    let id = matches.value_of("ID").unwrap();

    match runtime.state(id) {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output).unwrap());
            0
        }
        Err(err) => {
            eprintln!("{}", err);
            1
        }
    }
}

fn cmd_kill(runtime: &Runtime, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let id = matches.value_of("ID").unwrap();
    let signal = parse_signal(matches.value_of("SIGNAL").unwrap_or("SIGTERM"))?;

    let target = if matches.is_present("all") {
        KillTarget::All
    } else if let Some(pid) = matches.value_of("pid") {
        KillTarget::Pid(pid.parse()?)
    } else {
        KillTarget::Primary
    };

    runtime.kill(id, signal, target)
}

fn cmd_exec(runtime: &Runtime, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let id = matches.value_of("ID").unwrap();
    let console_socket = matches.value_of("console-socket").map(PathBuf::from);

    let process = if let Some(spec_file) = matches.value_of("process") {
        let bytes = std::fs::read(spec_file)?;
        serde_json::from_slice(&bytes)?
    } else {
        let argv: Vec<String> = matches
            .values_of("CMD")
            .ok_or_else(|| anyhow::anyhow!("either --process or a command must be given"))?
            .map(String::from)
            .collect();

        oci::Process {
            terminal: None,
            console_size: None,
            cwd: "/".to_string(),
            env: None,
            args: Some(argv),
            rlimits: None,
            user: oci::User {
                uid: 0,
                gid: 0,
                umask: None,
                additional_gids: None,
            },
        }
    };

    runtime.exec(id, process, console_socket.as_deref(), ProcessIo::default())
}

/// Parses a signal given as a decimal number or a `[SIG]NAME` (e.g.
/// `SIGTERM`, `TERM`, `15`).
fn parse_signal(raw: &str) -> anyhow::Result<i32> {
    if let Ok(n) = raw.parse::<i32>() {
        return Ok(n);
    }

    let name = raw.strip_prefix("SIG").unwrap_or(raw).to_uppercase();
    let signal = match name.as_str() {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "ILL" => libc::SIGILL,
        "ABRT" => libc::SIGABRT,
        "FPE" => libc::SIGFPE,
        "KILL" => libc::SIGKILL,
        "SEGV" => libc::SIGSEGV,
        "PIPE" => libc::SIGPIPE,
        "ALRM" => libc::SIGALRM,
        "TERM" => libc::SIGTERM,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "CHLD" => libc::SIGCHLD,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        "TTIN" => libc::SIGTTIN,
        "TTOU" => libc::SIGTTOU,
        _ => anyhow::bail!("unknown signal: {}", raw),
    };

    Ok(signal)
}
