use std::path::PathBuf;
use std::process;

use clap::{ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser};
use flexi_logger::Logger;
use log::debug;

use runguard::error::{RunguardError, RunguardExit};
use runguard::options::{
  parse_count, parse_size_kb, parse_time_pair, primary_group, resolve_group, resolve_user,
  RunguardOptions,
};
use runguard::report::TimeUsed;
use runguard::supervisor;
use runguard::utils::default_format;

#[derive(Parser, Debug)]
#[command(
  name = "runguard",
  version,
  disable_version_flag = true,
  about = "Run COMMAND with restrictions.",
  after_help = "\
Note that root privileges are needed for the `root' and `user' options. If
`user' is set, then `group' defaults to the same to prevent security issues,
since otherwise the process would retain group root permissions. The COMMAND
path is relative to the changed ROOT directory if specified. TIME may be
specified as a float; two floats separated by `:' are treated as soft and
hard limits. The runtime written to file is that of the last of wall/cpu
time options set, and defaults to CPU time when neither is set. When run
setuid without the `user' option, the user ID is set to the real user ID."
)]
struct Cli {
  #[arg(short = 'r', long = "root", value_name = "ROOT", help = "Run COMMAND with root directory set to ROOT")]
  root: Option<PathBuf>,

  #[arg(short = 'u', long = "user", value_name = "USER", help = "Run COMMAND as user with username or ID USER")]
  user: Option<String>,

  #[arg(short = 'g', long = "group", value_name = "GROUP", help = "Run COMMAND under group with name or ID GROUP")]
  group: Option<String>,

  #[arg(short = 'd', long = "chdir", value_name = "DIR", help = "Change to directory DIR after setting root directory")]
  chdir: Option<PathBuf>,

  #[arg(short = 't', long = "walltime", value_name = "TIME", help = "Kill COMMAND after TIME wallclock seconds")]
  walltime: Option<String>,

  #[arg(short = 'C', long = "cputime", value_name = "TIME", help = "Set maximum CPU time to TIME seconds")]
  cputime: Option<String>,

  #[arg(short = 'm', long = "memsize", value_name = "SIZE", help = "Set total memory limit to SIZE kB")]
  memsize: Option<String>,

  #[arg(short = 'f', long = "filesize", value_name = "SIZE", help = "Set maximum created filesize to SIZE kB")]
  filesize: Option<String>,

  #[arg(short = 'p', long = "nproc", value_name = "N", help = "Set maximum no. processes to N")]
  nproc: Option<String>,

  #[arg(short = 'P', long = "cpuset", value_name = "ID", help = "Use only processor number ID (or set, e.g. \"0,2-3\")")]
  cpuset: Option<String>,

  #[arg(short = 'c', long = "no-core", help = "Disable core dumps")]
  no_core: bool,

  #[arg(short = 'o', long = "stdout", value_name = "FILE", help = "Redirect COMMAND stdout output to FILE")]
  stdout: Option<PathBuf>,

  #[arg(short = 'e', long = "stderr", value_name = "FILE", help = "Redirect COMMAND stderr output to FILE")]
  stderr: Option<PathBuf>,

  #[arg(short = 's', long = "streamsize", value_name = "SIZE", help = "Truncate COMMAND stdout/stderr streams at SIZE kB")]
  streamsize: Option<String>,

  #[arg(short = 'E', long = "environment", help = "Preserve environment variables (default only PATH)")]
  environment: bool,

  #[arg(short = 'V', long = "variable", value_name = "KEY=VALUE", help = "Add additional environment variables (in form KEY=VALUE;KEY2=VALUE2); may be passed multiple times")]
  variable: Vec<String>,

  #[arg(short = 'M', long = "outmeta", value_name = "FILE", help = "Write metadata (runtime, exitcode, etc.) to FILE")]
  outmeta: Option<PathBuf>,

  #[arg(short = 'U', long = "runpipepid", value_name = "PID", help = "Process ID of runpipe to send SIGUSR1 signal when timelimit is reached")]
  runpipepid: Option<i32>,

  #[arg(short = 'v', long = "verbose", help = "Display some extra warnings and information")]
  verbose: bool,

  #[arg(short = 'q', long = "quiet", help = "Suppress all warnings and verbose output")]
  quiet: bool,

  #[arg(long = "version", action = ArgAction::Version, help = "Print version")]
  version: (),

  #[arg(
    value_name = "COMMAND",
    required = true,
    trailing_var_arg = true,
    allow_hyphen_values = true,
    help = "Command to run, with its arguments"
  )]
  command: Vec<String>,
}

impl Cli {
  fn resolve(self, time_used: TimeUsed) -> Result<RunguardOptions, RunguardError> {
    let mut words = self.command.into_iter();
    let Some(command) = words.next() else {
      return Err(RunguardError::cli("no command specified"));
    };
    let mut opts = RunguardOptions::new(command, words.collect::<Vec<_>>());
    opts.time_used = time_used;

    if let Some(text) = &self.walltime {
      opts.walltime = Some(parse_time_pair("walltime", text)?);
    }
    if let Some(text) = &self.cputime {
      opts.cputime = Some(parse_time_pair("cputime", text)?);
    }
    if let Some(text) = &self.memsize {
      opts.memory_bytes = parse_size_kb("memory limit", text, 1)?;
    }
    if let Some(text) = &self.filesize {
      opts.file_bytes = parse_size_kb("filesize limit", text, 1)?;
    }
    if let Some(text) = &self.streamsize {
      opts.stream_cap_bytes = parse_size_kb("streamsize limit", text, 0)?;
    }
    if let Some(text) = &self.nproc {
      opts.nproc = Some(parse_count("process limit", text)?);
    }

    if let Some(text) = &self.user {
      opts.run_user = Some(resolve_user(text)?);
    }
    if let Some(text) = &self.group {
      opts.run_gid = Some(resolve_group(text)?);
    }
    // Never leave the command with the invoker's group when it runs under
    // an unprivileged user.
    if let (Some(user), None) = (&opts.run_user, &opts.run_gid) {
      debug!("using unprivileged user `{}' also as group", user.raw);
      opts.run_gid = Some(primary_group(user.uid)?);
    }

    opts.cpuset = self.cpuset;
    opts.no_coredump = self.no_core;
    opts.root_dir = self.root;
    opts.root_chdir = self.chdir;
    opts.stdout_file = self.stdout;
    opts.stderr_file = self.stderr;
    opts.metadata_file = self.outmeta;
    opts.preserve_env = self.environment;
    opts.env_vars = self.variable;
    opts.runpipe_pid = self.runpipepid;
    opts.quiet = self.quiet;

    Ok(opts)
  }
}

/// `time-used` reports the clock of whichever time option came last.
fn resolve_time_used(matches: &ArgMatches) -> TimeUsed {
  let wall = matches.indices_of("walltime").and_then(|ix| ix.last());
  let cpu = matches.indices_of("cputime").and_then(|ix| ix.last());
  match (wall, cpu) {
    (Some(wall), Some(cpu)) if wall > cpu => TimeUsed::Wall,
    (Some(_), None) => TimeUsed::Wall,
    _ => TimeUsed::Cpu,
  }
}

fn bootstrap() -> Result<i32, RunguardError> {
  let matches = Cli::command().get_matches();
  let cli = Cli::from_arg_matches(&matches).map_err(|err| RunguardError::cli(err.to_string()))?;

  let level = if cli.quiet {
    "error"
  } else if cli.verbose {
    "debug"
  } else {
    "warn"
  };
  let _logger = Logger::try_with_str(level)?
    .log_to_stderr()
    .format(default_format)
    .start()?;

  debug!("starting in verbose mode, PID = {}", process::id());

  let time_used = resolve_time_used(&matches);
  let opts = cli.resolve(time_used)?;
  supervisor::execute(opts)
}

fn main() -> RunguardExit {
  match bootstrap() {
    Ok(exitcode) => RunguardExit::Code(exitcode),
    Err(err) => RunguardExit::Err(err),
  }
}
