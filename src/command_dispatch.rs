//! Purpose: Hold top-level CLI command dispatch for `dsmigrate`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Transfer commands always print their summary, including on failure.
//! Invariants: Only `completion` and `load --dry-run` run without a directory url.

use std::sync::Arc;

use dsmigrate::api::{
    Manifest, Transfer, TransferConfig, UnknownMembers,
    manifest::{self, Step},
};

use super::*;

pub(super) fn dispatch_command(
    command: Command,
    globals: &Globals,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "dsmigrate", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Backup { file } => {
            let directory = globals.directory()?;
            let transfer = transfer(TransferConfig::default(), color_mode);
            runtime()?.block_on(transfer.backup(&directory, file))?;
            Ok(RunOutcome::ok())
        }
        Command::Restore { file, strict } => {
            let directory = globals.directory()?;
            let config = TransferConfig {
                unknown_members: if strict {
                    UnknownMembers::Stop
                } else {
                    UnknownMembers::Skip
                },
                ..TransferConfig::default()
            };
            let transfer = transfer(config, color_mode);
            runtime()?.block_on(transfer.restore(&directory, file))?;
            Ok(RunOutcome::ok())
        }
        Command::Export { objects, relations } => {
            let directory = globals.directory()?;
            let transfer = transfer(TransferConfig::default(), color_mode);
            runtime()?.block_on(transfer.export(&directory, objects, relations))?;
            Ok(RunOutcome::ok())
        }
        Command::Import { files } => {
            let directory = globals.directory()?;
            let transfer = transfer(TransferConfig::default(), color_mode);
            runtime()?.block_on(transfer.import(&directory, &files))?;
            Ok(RunOutcome::ok())
        }
        Command::Load {
            manifest: path,
            dry_run,
        } => {
            let parsed = Manifest::read(&path)?;
            if dry_run {
                let plan = manifest::plan(&parsed)?;
                let mut stdout = io::stdout().lock();
                for step in &plan.steps {
                    writeln!(stdout, "{}", step_line(step)).map_err(stdout_error)?;
                }
                return Ok(RunOutcome::ok());
            }
            let directory = globals.directory()?;
            let counter = Counter::new();
            let result = manifest::load(&directory, &parsed, &counter);
            let _ = counter.render(&mut io::stdout().lock());
            result?;
            Ok(RunOutcome::ok())
        }
        Command::Save { manifest: path } => {
            let directory = globals.directory()?;
            let saved = manifest::save(&directory)?;
            saved.write(&path)?;
            println!(
                "saved {} object types to {}",
                saved.object_types.len(),
                path.display()
            );
            Ok(RunOutcome::ok())
        }
    }
}

fn transfer(config: TransferConfig, color_mode: ColorMode) -> Transfer {
    Transfer::new()
        .with_config(config)
        .with_observer(Arc::new(TerminalObserver::new(color_mode)))
}

fn runtime() -> Result<tokio::runtime::Runtime, Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })
}

fn step_line(step: &Step) -> String {
    match step {
        Step::ObjectType { name } => format!("object_type {name}"),
        Step::Permission { name } => format!("permission {name}"),
        Step::RelationType {
            object_type,
            name,
            unions,
            permissions,
        } => {
            let mut line = format!("relation_type {object_type}#{name}");
            if !unions.is_empty() {
                line.push_str(&format!(" union={}", unions.join(",")));
            }
            if !permissions.is_empty() {
                line.push_str(&format!(" permissions={}", permissions.join(",")));
            }
            line
        }
    }
}

fn stdout_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write to stdout")
        .with_source(err)
}
