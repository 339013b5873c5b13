#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Command-line interface for the Reaper process supervisor.
//!
//! # Usage
//!
//! Run a program and exit with its status (`128 + signal` if it was killed):
//! ```bash
//! reaper run -- sleep 5
//! ```
//!
//! Run it detached, as another user, with a pid file:
//! ```bash
//! reaper run --daemonize --log-file /var/log/app.log --pid-file /run/app.pid --user app -- app
//! ```
//!
//! Inspect the user/group database and the current process ids:
//! ```bash
//! reaper lookup user root
//! reaper ids
//! ```

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use reaper::{
    daemon::{self, DaemonError, Detached},
    pidfile::{PidFile, PidFileError},
    posix::identity,
    supervise::{self, Credentials, SuperviseError, Supervisor},
};
use thiserror::Error;

const DEV_NULL: &str = "/dev/null";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a program under supervision and exit with its status
    Run {
        /// Detach from the terminal before starting the program
        #[arg(long)]
        daemonize: bool,

        /// File the daemon's standard output and error are appended to
        #[arg(long, env = "REAPER_LOG_FILE")]
        log_file: Option<PathBuf>,

        /// Pid file to create for the supervisor
        #[arg(long, env = "REAPER_PID_FILE")]
        pid_file: Option<PathBuf>,

        /// User to run the program as
        #[arg(long)]
        user: Option<String>,

        /// Group to run the program as (defaults to the user's primary group)
        #[arg(long)]
        group: Option<String>,

        /// The program followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Print a user or group record as JSON
    Lookup {
        #[command(subcommand)]
        kind: LookupKind,
    },
    /// Print this process's pid, parent pid, effective uid and effective gid as JSON
    Ids,
}

#[derive(Subcommand, Debug)]
enum LookupKind {
    User { name: String },
    Group { name: String },
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Supervise(#[from] SuperviseError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    #[error(transparent)]
    Posix(#[from] reaper::posix::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Exit statuses outside `0..=255` can't be passed on and become 1.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn run(
    daemonize: bool,
    log_file: Option<&Path>,
    pid_file: Option<PathBuf>,
    credentials: Credentials,
    command: &[String],
) -> Result<ExitCode, RunError> {
    let ready = if daemonize {
        match daemon::daemonize(log_file.unwrap_or_else(|| Path::new(DEV_NULL)))? {
            Detached::Original { ready } => {
                return Ok(if ready {
                    ExitCode::SUCCESS
                } else {
                    log::error!("daemon exited before it was ready");
                    ExitCode::FAILURE
                });
            }
            Detached::Daemon(ready) => Some(ready),
        }
    } else {
        None
    };

    let _pid_file = pid_file.map(PidFile::create).transpose()?;

    supervise::forward_termination_signals()?;

    let supervisor = Supervisor::new()?;
    supervisor.spawn(command, credentials)?;

    if let Some(ready) = ready {
        ready.notify()?;
    }

    let termination = supervisor.wait()?;

    Ok(termination
        .shell_code()
        .map_or(ExitCode::FAILURE, |x| ExitCode::from(exit_status(x))))
}

fn lookup(kind: &LookupKind) -> Result<ExitCode, RunError> {
    let (json, kind, name) = match kind {
        LookupKind::User { name } => (
            identity::lookup_user(name)?
                .map(|x| serde_json::to_string_pretty(&x))
                .transpose()?,
            "user",
            name,
        ),
        LookupKind::Group { name } => (
            identity::lookup_group(name)?
                .map(|x| serde_json::to_string_pretty(&x))
                .transpose()?,
            "group",
            name,
        ),
    };

    Ok(if let Some(json) = json {
        println!("{json}");
        ExitCode::SUCCESS
    } else {
        eprintln!("{kind} '{name}' not found");
        ExitCode::FAILURE
    })
}

fn ids() -> Result<ExitCode, RunError> {
    let json = serde_json::json!({
        "pid": identity::get_pid(),
        "ppid": identity::get_ppid(),
        "euid": identity::get_euid(),
        "egid": identity::get_egid(),
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    if let Err(e) = reaper_logging::init() {
        eprintln!("couldn't initialize logging: {e}");
    }

    let args = Args::parse();

    let result = match args.cmd {
        Commands::Run {
            daemonize,
            log_file,
            pid_file,
            user,
            group,
            command,
        } => Credentials::resolve(user.as_deref(), group.as_deref())
            .map_err(RunError::from)
            .and_then(|credentials| {
                run(daemonize, log_file.as_deref(), pid_file, credentials, &command)
            }),
        Commands::Lookup { kind } => lookup(&kind),
        Commands::Ids => ids(),
    };

    result.unwrap_or_else(|e| {
        log::error!("{e}");
        eprintln!("reaper: {e}");
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod test {
    use clap::CommandFactory as _;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test_log::test]
    fn run_keeps_program_arguments_verbatim() {
        let args =
            Args::try_parse_from(["reaper", "run", "--user", "app", "--", "ls", "-la", "/tmp"])
                .unwrap();

        let Commands::Run {
            daemonize,
            user,
            group,
            command,
            ..
        } = args.cmd
        else {
            panic!("expected run");
        };

        assert!(!daemonize);
        assert_eq!(user.as_deref(), Some("app"));
        assert_eq!(group, None);
        assert_eq!(command, vec!["ls", "-la", "/tmp"]);
    }

    #[test_log::test]
    fn run_requires_a_program() {
        assert!(Args::try_parse_from(["reaper", "run", "--daemonize"]).is_err());
    }

    #[test_log::test]
    fn exit_status_covers_signal_range() {
        assert_eq!(exit_status(143), 143);
        assert_eq!(exit_status(255), 255);
        assert_eq!(exit_status(-1), 1);
        assert_eq!(exit_status(256), 1);
    }
}
