use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use finix::{
    api::{self, Command, Frame, Snapshot},
    error::ControlError,
    runtime::Paths,
};

/// Control tool for a running finix supervisor.
#[derive(Parser)]
#[command(name = "finixctl", version, author)]
#[command(about = "Control a running finix supervisor", long_about = None)]
struct Cli {
    /// Run directory of the supervisor (defaults to /run/finix).
    #[arg(long, value_name = "DIR")]
    rundir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a service by name, name:instance, or job id.
    Start {
        /// Service selector.
        name: String,
    },

    /// Stop a service.
    Stop {
        /// Service selector.
        name: String,
    },

    /// Restart a service.
    Restart {
        /// Service selector.
        name: String,
    },

    /// Reconcile the on-disk configuration.
    Reload,

    /// List every record.
    Status {
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show one record.
    Show {
        /// Service selector.
        name: String,

        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Print the runlevel, or change to LEVEL.
    Runlevel {
        /// Target level (0-9 or S).
        level: Option<String>,
    },

    /// Show the unmet start conditions of a service.
    Query {
        /// Service selector.
        name: String,
    },

    /// Assert (+cond) or clear (-cond) a condition fact.
    Emit {
        /// Signed condition path, e.g. +net/eth0/up.
        cond: String,
    },

    /// Show inetd connection statistics for a service.
    Inetd {
        /// Service selector.
        name: String,
    },

    /// Toggle supervisor debug logging.
    Debug,
}

fn main() {
    process::exit(run());
}

/// Exit codes: 0 on ACK, 1 on NACK, 2 on transport failure.
fn run() -> i32 {
    let cli = Cli::parse();
    let paths = match &cli.rundir {
        Some(dir) => {
            let mut paths = Paths::system();
            paths.run_dir = dir.clone();
            paths
        }
        None => Paths::system(),
    };
    let socket = paths.control_socket();

    let (request, render) = build_request(&cli.command);
    match api::send_request(&socket, &request) {
        Ok(frames) => {
            render(&frames);
            0
        }
        Err(ControlError::Nack) => {
            eprintln!("finixctl: request refused");
            1
        }
        Err(err) => {
            eprintln!("finixctl: {err}");
            2
        }
    }
}

type Render = Box<dyn Fn(&[Frame])>;

fn build_request(command: &Commands) -> (Frame, Render) {
    let silent: Render = Box::new(|_| {});
    match command {
        Commands::Start { name } => (Frame::with_text(Command::Start, name), silent),
        Commands::Stop { name } => (Frame::with_text(Command::Stop, name), silent),
        Commands::Restart { name } => (Frame::with_text(Command::Restart, name), silent),
        Commands::Reload => (Frame::new(Command::Reload), silent),
        Commands::Debug => (Frame::new(Command::Debug), silent),
        Commands::Emit { cond } => (Frame::with_text(Command::Event, cond), silent),
        Commands::Status { json } => {
            let json = *json;
            (
                Frame::new(Command::Enumerate),
                Box::new(move |frames| print_snapshots(frames, json)),
            )
        }
        Commands::Show { name, json } => {
            let json = *json;
            (
                Frame::with_text(Command::Find, name),
                Box::new(move |frames| print_snapshots(frames, json)),
            )
        }
        Commands::Runlevel { level } => match level {
            Some(level) => {
                let mut frame = Frame::new(Command::Runlevel);
                frame.runlevel = level.bytes().next().map(normalize_level).unwrap_or(0);
                (frame, silent)
            }
            None => (
                Frame::new(Command::GetRunlevel),
                Box::new(|frames| {
                    for frame in frames {
                        println!("{}", frame.text());
                    }
                }),
            ),
        },
        Commands::Query { name } => (
            Frame::with_text(Command::Query, name),
            Box::new(|frames| {
                for frame in frames {
                    println!("{}", frame.text());
                }
            }),
        ),
        Commands::Inetd { name } => (
            Frame::with_text(Command::InetdQuery, name),
            Box::new(|frames| {
                for frame in frames {
                    println!("{}", frame.text());
                }
            }),
        ),
    }
}

fn normalize_level(byte: u8) -> u8 {
    match byte {
        b'S' | b's' => 1,
        digit @ b'0'..=b'9' => digit - b'0',
        _ => 0,
    }
}

fn print_snapshots(frames: &[Frame], json: bool) {
    let snapshots: Vec<Snapshot> = frames
        .iter()
        .filter_map(|frame| Snapshot::from_text(frame.text()))
        .collect();

    if json {
        match serde_json::to_string_pretty(&snapshots) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => eprintln!("finixctl: cannot render JSON: {err}"),
        }
        return;
    }

    println!(
        "{:<6} {:<16} {:<9} {:>7} {:<8} COMMAND",
        "JOB", "NAME", "STATE", "PID", "LEVELS"
    );
    for snap in snapshots {
        let job = if snap.instance.is_empty() {
            snap.job.to_string()
        } else {
            format!("{}:{}", snap.job, snap.instance)
        };
        println!(
            "{:<6} {:<16} {:<9} {:>7} {:<8} {}",
            job, snap.name, snap.state, snap.pid, snap.levels, snap.command
        );
    }
}
