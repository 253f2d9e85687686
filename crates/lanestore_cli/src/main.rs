//! CLI admin entry point.
//!
//! # Responsibility
//! - Open a store from a JSON stack config and report its migration state.
//! - Optionally migrate (`--migrate`) and print per-entity object counts.
//! - Keep output line-oriented (`key=value`) for scripting.

use lanestore_core::{
    core_version, init_with, FetchRequest, PersistenceStack, StackConfig, StackResult,
};
use std::process::ExitCode;

const USAGE: &str = "usage: lanestore_cli <stack-config.json> [--migrate]";

fn main() -> ExitCode {
    let mut config_path = None;
    let mut migrate = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--migrate" => migrate = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                return ExitCode::SUCCESS;
            }
            _ if config_path.is_none() => config_path = Some(arg),
            _ => {
                eprintln!("{USAGE}");
                return ExitCode::from(2);
            }
        }
    }

    println!("lanestore_core version={}", core_version());
    let Some(config_path) = config_path else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    match run(&config_path, migrate) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err.code().map_or(0, |code| code as u32);
            eprintln!("error domain={} code={} message={}", err.domain(), code, err);
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: &str, migrate: bool) -> StackResult<()> {
    let config = StackConfig::from_json_file(config_path)?;
    if let Some(logging) = &config.logging {
        if let Err(err) = init_with(logging) {
            eprintln!("logging disabled: {err}");
        }
    }

    let stack = PersistenceStack::open(config.into_options()?)?;
    let store = stack.store();
    println!("store kind={} stamped_version={}", store.kind(), store.stamped_version());
    println!(
        "schema name={} version={}",
        store.schema().name,
        store.schema().version
    );
    println!("requires_migration={}", stack.requires_migration());

    if stack.requires_migration() {
        if !migrate {
            log::warn!("event=cli_run module=cli status=pending reason=migration_required");
            return Ok(());
        }
        stack.migrate()?;
        println!("migrated to_version={}", store.schema().version);
    }

    for entity in stack.registry().entity_names() {
        let count = stack.count(&FetchRequest::new(entity))?;
        println!("entity name={entity} count={count}");
    }

    stack.close()
}
