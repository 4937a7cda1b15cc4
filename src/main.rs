//! Purpose: `dsmigrate` CLI entry point.
//! Role: Binary crate root; parses args, installs logging, runs commands, reports errors.
//! Invariants: Summaries go to stdout; progress, notices, and errors go to stderr.
//! Invariants: Non-interactive errors and notices are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use dsmigrate::api::{Error, ErrorKind, RemoteDirectory, TransferObserver, to_exit_code};
use dsmigrate::core::counter::{Counter, Item};
use dsmigrate::notice::{Notice, notice_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                let message = clap_error_summary(&err);
                let hint = clap_error_hint(&err);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint(hint),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    let color_mode = cli.color;
    let globals = Globals {
        url: cli.url,
        token: cli.token,
        timeout: cli.timeout,
    };

    command_dispatch::dispatch_command(cli.command, &globals, color_mode)
        .map_err(add_io_hint)
        .map_err(add_service_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "dsmigrate",
    version,
    about = "Back up, restore, import, and export directory authorization data",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Moves object types, permissions, relation types, objects, and relations
between a directory service and local files.

Mental model:
  - `backup` / `restore` move everything through one .tar.gz archive
  - `export` / `import` move plain JSON documents, one kind per file
  - `load` / `save` move the authorization model as a YAML manifest
"#,
    after_help = r#"EXAMPLES
  $ dsmigrate --url http://localhost:9393 backup backup.tar.gz
  $ dsmigrate --url http://localhost:9393 restore backup.tar.gz
  $ dsmigrate --url http://localhost:9393 load manifest.yaml

LEARN MORE
  $ dsmigrate <command> --help
  RUST_LOG=debug shows per-record diagnostics on stderr."#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "DSMIGRATE_URL",
        help = "Directory base url, e.g. http://localhost:9393"
    )]
    url: Option<String>,
    #[arg(
        long,
        global = true,
        env = "DSMIGRATE_TOKEN",
        hide_env_values = true,
        help = "Bearer token sent with every directory request"
    )]
    token: Option<String>,
    #[arg(
        long,
        global = true,
        value_parser = parse_duration_arg,
        help = "Request timeout: number plus ms|s|m|h (e.g. 30s)"
    )]
    timeout: Option<Duration>,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Write every kind from the directory into one archive",
        after_help = r#"EXAMPLES
  $ dsmigrate backup backup.tar.gz"#
    )]
    Backup {
        #[arg(help = "Archive to write (.tar.gz)", value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
    #[command(
        arg_required_else_help = true,
        about = "Replay an archive written by `backup` into the directory",
        after_help = r#"EXAMPLES
  $ dsmigrate restore backup.tar.gz
  $ dsmigrate restore --strict backup.tar.gz"#
    )]
    Restore {
        #[arg(help = "Archive to read (.tar.gz)", value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(long, help = "Stop at the first unrecognized archive member instead of skipping it")]
        strict: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Write objects and relations to two JSON documents",
        after_help = r#"EXAMPLES
  $ dsmigrate export --objects objects.json --relations relations.json"#
    )]
    Export {
        #[arg(long, help = "Objects document to write", value_hint = ValueHint::FilePath)]
        objects: PathBuf,
        #[arg(long, help = "Relations document to write", value_hint = ValueHint::FilePath)]
        relations: PathBuf,
    },
    #[command(
        arg_required_else_help = true,
        about = "Replay JSON documents into the directory",
        long_about = r#"Replay JSON documents into the directory.

Each file holds one kind, named by its root key (e.g. {"objects": [...]}).
Files are replayed model kinds first, regardless of argument order.
Files that are not record documents are skipped with a notice."#,
        after_help = r#"EXAMPLES
  $ dsmigrate import relations.json objects.json"#
    )]
    Import {
        #[arg(required = true, help = "Documents to import", value_hint = ValueHint::FilePath)]
        files: Vec<PathBuf>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Create the model described by a manifest",
        after_help = r#"EXAMPLES
  $ dsmigrate load manifest.yaml
  $ dsmigrate load --dry-run manifest.yaml"#
    )]
    Load {
        #[arg(help = "Manifest to load (YAML)", value_hint = ValueHint::FilePath)]
        manifest: PathBuf,
        #[arg(long, help = "Print the ordered writes without contacting the directory")]
        dry_run: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Write the directory's model as a manifest",
        after_help = r#"EXAMPLES
  $ dsmigrate save manifest.yaml"#
    )]
    Save {
        #[arg(help = "Manifest to write (YAML)", value_hint = ValueHint::FilePath)]
        manifest: PathBuf,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ dsmigrate completion bash > ~/.local/share/bash-completion/completions/dsmigrate
  $ dsmigrate completion zsh > ~/.zfunc/_dsmigrate"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

struct Globals {
    url: Option<String>,
    token: Option<String>,
    timeout: Option<Duration>,
}

impl Globals {
    fn directory(&self) -> Result<RemoteDirectory, Error> {
        let Some(url) = self.url.as_deref() else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("no directory url")
                .with_hint("Pass --url or set DSMIGRATE_URL."));
        };
        let mut directory = RemoteDirectory::new(url)?;
        if let Some(token) = &self.token {
            directory = directory.with_token(token.clone());
        }
        if let Some(timeout) = self.timeout {
            directory = directory.with_timeout(timeout);
        }
        Ok(directory)
    }
}

/// Renders transfer progress and notices on stderr and the summary on stdout.
struct TerminalObserver {
    color_mode: ColorMode,
    live: bool,
}

impl TerminalObserver {
    fn new(color_mode: ColorMode) -> Self {
        Self {
            color_mode,
            live: io::stderr().is_terminal(),
        }
    }

    fn clear_line(&self) {
        if self.live {
            let mut stderr = io::stderr().lock();
            let _ = write!(stderr, "\u{1b}[2K\r");
            let _ = stderr.flush();
        }
    }
}

impl TransferObserver for TerminalObserver {
    fn on_progress(&self, item: &Item) {
        if self.live {
            let _ = item.render(&mut io::stderr().lock());
        }
    }

    fn on_notice(&self, notice: &Notice) {
        self.clear_line();
        emit_notice(notice, self.color_mode);
    }

    fn on_finish(&self, counter: &Counter) {
        self.clear_line();
        let _ = counter.render(&mut io::stdout().lock());
    }
}

fn parse_duration_arg(input: &str) -> Result<Duration, String> {
    parse_duration(input).map_err(|err| error_message(&err))
}

fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message("invalid duration")
            .with_hint("Use a number plus ms|s|m|h (e.g. 30s).")
    };
    let trimmed = input.trim();
    let split = trimmed.char_indices().find(|(_, ch)| !ch.is_ascii_digit());
    let (num_str, unit) = match split {
        Some((idx, _)) => trimmed.split_at(idx),
        None => ("", ""),
    };
    if num_str.is_empty() || unit.is_empty() {
        return Err(invalid());
    }
    let value: u64 = num_str.parse().map_err(|_| invalid())?;
    let millis = match unit {
        "ms" => value,
        "s" => value.saturating_mul(1_000),
        "m" => value.saturating_mul(60_000),
        "h" => value.saturating_mul(3_600_000),
        _ => return Err(invalid()),
    };
    Ok(Duration::from_millis(millis))
}

fn add_io_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() {
        return err;
    }
    err.with_hint("I/O error. Check the path, the directory url, and disk space.")
}

fn add_service_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Service || err.hint().is_some() {
        return err;
    }
    err.with_hint("The directory rejected the request. Check --url, --token, and the model loaded there.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share command/context if it persists.",
    )
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn emit_notice(notice: &Notice, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        let label = colorize_label("notice:", color_mode.use_color(is_tty), AnsiColor::Yellow);
        eprintln!("{label} {} ({})", notice.message, notice.source);
        return;
    }

    let value = notice_json(notice);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Format => "malformed document".to_string(),
        ErrorKind::Schema => "record has unknown fields".to_string(),
        ErrorKind::Service => "directory rejected the request".to_string(),
        ErrorKind::Dependency => "unresolvable relation dependencies".to_string(),
        ErrorKind::Cancelled => "operation cancelled".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(record) = err.record() {
        inner.insert("record".to_string(), json!(record.root_key()));
    }
    if let Some(index) = err.index() {
        inner.insert("index".to_string(), json!(index));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(index) = err.index() {
        lines.push(format!(
            "{} {index}",
            colorize_label("record:", use_color, AnsiColor::Yellow)
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `dsmigrate --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "dsmigrate") else {
        return "Try `dsmigrate --help`.".to_string();
    };

    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();

    if parts.is_empty() {
        return "Try `dsmigrate --help`.".to_string();
    }
    format!("Try `dsmigrate {} --help`.", parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::{Cli, Error, ErrorKind, error_json, error_text, parse_duration};
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_duration_accepts_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn parse_duration_rejects_bare_numbers_and_unknown_units() {
        for input in ["", "30", "s", "5d", "-1s"] {
            let err = parse_duration(input).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Usage, "input {input:?}");
        }
    }

    #[test]
    fn error_text_lists_hint_path_and_cause() {
        let err = Error::new(ErrorKind::Format)
            .with_message("not a record document")
            .with_hint("Wrap the array in an object.")
            .with_path("data/objects.json")
            .with_source(std::io::Error::other("bad byte"));
        let text = error_text(&err, false);
        assert_eq!(
            text,
            "error: not a record document\nhint: Wrap the array in an object.\npath: data/objects.json\ncaused by: bad byte"
        );
    }

    #[test]
    fn error_json_names_kind_and_record() {
        let err = Error::new(ErrorKind::Schema)
            .with_record(dsmigrate::core::kind::RecordKind::Object)
            .with_index(7);
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Schema");
        assert_eq!(value["error"]["record"], "objects");
        assert_eq!(value["error"]["index"], 7);
        assert_eq!(value["error"]["message"], "record has unknown fields");
    }
}
