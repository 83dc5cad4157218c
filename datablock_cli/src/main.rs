//! # DataBlock Admin CLI
//!
//! Diagnostic and recovery tooling for a DataBlock channel, used
//! out-of-band from the data plane (§4.6, §6.4).
//!
//! # Usage
//!
//! ```bash
//! datablock_cli diagnose ticks --slot 5
//! datablock_cli recover ticks --slot 5 --action release-writer
//! datablock_cli cleanup ticks --timeout-ms 5000
//! datablock_cli validate ticks
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | success |
//! | 2 | no action taken (nothing to fix) |
//! | 3 | unsafe (needs `--force`) |
//! | 4 | invalid segment |
//! | 5 | internal error |

#![deny(warnings)]

use clap::{Parser, Subcommand, ValueEnum};
use datablock_common::error::DataBlockError;
use datablock_core::recovery::RecoveryHandle;
use serde::Serialize;
use tracing::error;

const EXIT_OK: i32 = 0;
const EXIT_NO_ACTION: i32 = 2;
const EXIT_UNSAFE: i32 = 3;
const EXIT_INVALID_SEGMENT: i32 = 4;
const EXIT_INTERNAL_ERROR: i32 = 5;

/// DataBlock admin tool: diagnose and repair a channel's shared-memory
/// segment.
#[derive(Parser, Debug)]
#[command(name = "datablock_cli")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Diagnostic and recovery admin tool for DataBlock channels")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Emit structured JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot a slot's RW state (or every slot if `--slot` is omitted).
    Diagnose {
        /// Channel name.
        shm_name: String,
        /// Physical slot index; every slot is diagnosed if omitted.
        #[arg(long)]
        slot: Option<usize>,
    },
    /// Apply a recovery action to one slot.
    Recover {
        /// Channel name.
        shm_name: String,
        /// Physical slot index to act on.
        #[arg(long)]
        slot: usize,
        /// Which recovery action to apply.
        #[arg(long)]
        action: RecoverAction,
        /// Bypass the liveness/stuck safety check.
        #[arg(long)]
        force: bool,
    },
    /// Clear stale consumer heartbeat registrations.
    Cleanup {
        /// Channel name.
        shm_name: String,
        /// Heartbeat staleness threshold in milliseconds.
        #[arg(long, default_value_t = datablock_common::consts::DEFAULT_HEARTBEAT_TIMEOUT_MS)]
        timeout_ms: u64,
    },
    /// Validate segment integrity (magic, version, index ordering,
    /// checksums).
    Validate {
        /// Channel name.
        shm_name: String,
        /// Attempt `auto_recover` if validation uncovers a stuck slot or
        /// dead consumer heartbeats (still requires `--force` for
        /// unsafe actions).
        #[arg(long)]
        repair: bool,
    },
}

/// §6.4 `--action {release_writer | release_readers | reset}`.
#[derive(ValueEnum, Debug, Clone, Copy)]
enum RecoverAction {
    #[value(name = "release_writer")]
    ReleaseWriter,
    #[value(name = "release_readers")]
    ReleaseReaders,
    #[value(name = "reset")]
    Reset,
}

#[derive(Serialize)]
struct JsonOutput<T: Serialize> {
    ok: bool,
    data: T,
}

fn print_result<T: Serialize + std::fmt::Debug>(json: bool, data: &T) {
    if json {
        let out = JsonOutput { ok: true, data };
        println!("{}", serde_json::to_string_pretty(&out).expect("serialization cannot fail"));
    } else {
        println!("{data:#?}");
    }
}

fn exit_code_for_error(err: &DataBlockError) -> i32 {
    match err {
        DataBlockError::Unsafe { .. } => EXIT_UNSAFE,
        DataBlockError::NotStuck { .. } => EXIT_NO_ACTION,
        DataBlockError::MagicMismatch { .. }
        | DataBlockError::VersionMismatch { .. }
        | DataBlockError::CorruptHeader { .. }
        | DataBlockError::SizeMismatch { .. }
        | DataBlockError::InitTimeout { .. }
        | DataBlockError::NotFound { .. } => EXIT_INVALID_SEGMENT,
        _ => EXIT_INTERNAL_ERROR,
    }
}

fn report_error(json: bool, err: DataBlockError) -> i32 {
    let code = exit_code_for_error(&err);
    if json {
        let out = serde_json::json!({ "ok": false, "error": err.to_string() });
        println!("{}", serde_json::to_string_pretty(&out).unwrap());
    } else {
        error!(error = %err, "command failed");
    }
    code
}

fn run(args: Args) -> i32 {
    match args.command {
        Command::Diagnose { shm_name, slot } => {
            let recovery = match RecoveryHandle::attach(&shm_name) {
                Ok(r) => r,
                Err(e) => return report_error(args.json, e),
            };
            match slot {
                Some(i) => match recovery.diagnose(i) {
                    Ok(diag) => {
                        print_result(args.json, &diag);
                        EXIT_OK
                    }
                    Err(e) => report_error(args.json, e),
                },
                None => {
                    let diags = recovery.diagnose_all();
                    print_result(args.json, &diags);
                    EXIT_OK
                }
            }
        }
        Command::Recover { shm_name, slot, action, force } => {
            let recovery = match RecoveryHandle::attach(&shm_name) {
                Ok(r) => r,
                Err(e) => return report_error(args.json, e),
            };
            let result = match action {
                RecoverAction::ReleaseWriter => recovery.release_zombie_writer(slot),
                RecoverAction::ReleaseReaders => recovery.release_zombie_readers(slot, force),
                RecoverAction::Reset => recovery.force_reset_slot(slot, force),
            };
            match result {
                Ok(()) => {
                    print_result(args.json, &serde_json::json!({ "slot": slot, "action": "applied" }));
                    EXIT_OK
                }
                Err(e) => report_error(args.json, e),
            }
        }
        Command::Cleanup { shm_name, timeout_ms } => {
            let recovery = match RecoveryHandle::attach(&shm_name) {
                Ok(r) => r,
                Err(e) => return report_error(args.json, e),
            };
            let cleared = recovery.cleanup_dead_consumers(timeout_ms * 1_000_000);
            print_result(args.json, &cleared);
            if cleared.is_empty() { EXIT_NO_ACTION } else { EXIT_OK }
        }
        Command::Validate { shm_name, repair } => {
            let recovery = match RecoveryHandle::attach(&shm_name) {
                Ok(r) => r,
                Err(e) => return report_error(args.json, e),
            };
            match recovery.validate_integrity() {
                Ok(()) => {
                    print_result(args.json, &serde_json::json!({ "valid": true }));
                    EXIT_OK
                }
                Err(e) => {
                    if repair {
                        let actions = recovery.auto_recover(
                            datablock_common::consts::DEFAULT_HEARTBEAT_TIMEOUT_MS * 1_000_000,
                            false,
                        );
                        print_result(args.json, &actions);
                        if actions.is_empty() { EXIT_NO_ACTION } else { EXIT_OK }
                    } else {
                        report_error(args.json, e)
                    }
                }
            }
        }
    }
}

fn main() {
    let args = Args::parse();
    datablock_common::config::init_tracing(datablock_common::config::LogLevel::Info);
    let code = run(args);
    std::process::exit(code);
}
