//! wasm-handoff CLI entry point.
//!
//! `run` hands one unit of work per `--work` value to a fresh worker
//! context, all workers sharing a single linear memory. `compile` writes an
//! AOT artifact that `run` (and workers resolving a `.cwasm` location) can
//! load without recompiling.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wasm_handoff_common::{ConfigFile, RuntimeConfig};
use wasm_handoff_core::{
    BindingRegistry, CompiledModule, HandoffMessage, SharedLinearMemory, WasmEngine,
    WorkDescriptor, WorkerSpawner, fault_channel,
};
use wasm_handoff_host::create_instance_runner;

#[derive(Debug, Parser)]
#[command(name = "wasm-handoff", version, about)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "WASM_HANDOFF_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run work descriptors in worker contexts sharing one memory.
    Run(RunArgs),

    /// Precompile a module into a `.cwasm` artifact.
    Compile {
        /// Module to compile (`.wasm` or `.wat`).
        input: PathBuf,

        /// Output artifact path; defaults to `{hash}.cwasm` in the
        /// configured cache directory (or the current directory).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Configuration file; engine settings must match the runtime's.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Module file to register (`.wasm` or `.cwasm`).
    #[arg(long, required_unless_present = "config")]
    module: Option<PathBuf>,

    /// Location workers resolve; defaults to the module path.
    #[arg(long)]
    location: Option<String>,

    /// Entry point export called with each work descriptor.
    #[arg(long)]
    entry_point: Option<String>,

    /// Work descriptors; one worker is spawned per value.
    #[arg(long = "work", required = true, num_args = 1..)]
    work: Vec<u32>,

    /// Print `len` bytes at `offset` of the shared memory after all
    /// workers have ended, as `offset:len`.
    #[arg(long, value_parser = parse_dump_range)]
    dump: Option<DumpRange>,
}

#[derive(Debug, Clone, Copy)]
struct DumpRange {
    offset: usize,
    len: usize,
}

fn parse_dump_range(s: &str) -> Result<DumpRange, String> {
    let (offset, len) = s
        .split_once(':')
        .ok_or_else(|| format!("expected offset:len, got '{s}'"))?;
    Ok(DumpRange {
        offset: offset.parse().map_err(|e| format!("invalid offset: {e}"))?,
        len: len.parse().map_err(|e| format!("invalid length: {e}"))?,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Compile {
            input,
            output,
            config,
        } => compile(&input, output, config.as_deref()),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,wasm_handoff=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    // stdout is reserved for --dump output
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ConfigFile> {
    match path {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(ConfigFile::default()),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let mut runtime: RuntimeConfig = config.runtime.clone();
    if let Some(entry_point) = args.entry_point {
        runtime.worker.entry_point = entry_point;
    }

    let engine = WasmEngine::new(&runtime.engine)?;
    let runner = create_instance_runner(Arc::new(engine.inner().clone()))?;
    let registry = Arc::new(BindingRegistry::new(engine.clone(), Arc::new(runner)));

    for entry in &config.modules {
        let module = registry
            .load_file(&entry.location, &entry.path)
            .with_context(|| format!("Failed to load module '{}'", entry.location))?;
        if let Some(entry_point) = &entry.entry_point {
            let bindings = registry
                .register(&entry.location, &module)
                .with_entry_point(entry_point.clone());
            registry.insert(&entry.location, bindings);
        }
    }

    let location = match (&args.module, args.location) {
        (Some(path), location) => {
            let location = location.unwrap_or_else(|| path.display().to_string());
            registry
                .load_file(&location, path)
                .with_context(|| format!("Failed to load module {}", path.display()))?;
            location
        }
        (None, Some(location)) => location,
        (None, None) => match config.modules.as_slice() {
            [only] => only.location.clone(),
            _ => bail!("--location is required when the config registers several modules"),
        },
    };

    let module = registry
        .module(&location)
        .with_context(|| format!("No module registered under '{location}'"))?;

    // Without a config file the memory is shaped after the module's import.
    let import = module.memory_import(
        &runtime.worker.memory_import_module,
        &runtime.worker.memory_import_name,
    );
    let memory = match import {
        Some(import) if args.config.is_none() => SharedLinearMemory::for_import(&engine, &import)?,
        _ => SharedLinearMemory::from_config(&engine, &runtime.memory)?,
    };

    info!(
        location = %location,
        workers = args.work.len(),
        memory_pages = memory.size_pages(),
        "Starting workers"
    );

    let (reporter, mut faults) = fault_channel();
    let spawner = WorkerSpawner::new(engine, registry, runtime.worker, reporter);

    let mut handles = Vec::with_capacity(args.work.len());
    for work in &args.work {
        let message = HandoffMessage::new(
            location.as_str(),
            module.clone(),
            memory.clone(),
            WorkDescriptor::new(*work),
        );
        handles.push(spawner.spawn_with(message)?);
    }

    let total = handles.len();
    let mut failed = 0;
    for handle in handles {
        if handle.join().await.is_err() {
            failed += 1;
        }
    }

    for fault in faults.drain() {
        error!(
            worker_id = %fault.worker_id(),
            kind = %fault.kind(),
            error = %fault.error(),
            "Worker fault"
        );
    }

    if let Some(range) = args.dump {
        match memory.read(range.offset, range.len) {
            Ok(bytes) => println!("{}", hex_dump(range.offset, &bytes)),
            Err(e) => warn!(error = %e, "Cannot dump memory"),
        }
    }

    if failed > 0 {
        bail!("{failed} of {total} workers failed");
    }

    info!(workers = total, "All workers completed");
    Ok(())
}

fn compile(input: &Path, output: Option<PathBuf>, config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let engine = WasmEngine::new(&config.runtime.engine)?;

    let module = if input.extension().is_some_and(|ext| ext == "wat") {
        let wat = std::fs::read_to_string(input)
            .with_context(|| format!("Failed to read {}", input.display()))?;
        CompiledModule::from_wat(engine.inner(), &wat)?
    } else {
        CompiledModule::from_file(engine.inner(), input)?
    };

    // Precompiled artifacts are named after their module family.
    let output = output.unwrap_or_else(|| {
        let dir = config.runtime.engine.cache_dir.as_deref().unwrap_or(".");
        Path::new(dir).join(format!("{}.cwasm", module.content_hash()))
    });

    let bytes = module.serialize()?;
    std::fs::write(&output, &bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        input = %input.display(),
        output = %output.display(),
        content_hash = %module.content_hash(),
        bytes = bytes.len(),
        "Module precompiled"
    );
    Ok(())
}

fn hex_dump(offset: usize, bytes: &[u8]) -> String {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, row)| {
            let hex: Vec<String> = row.iter().map(|b| format!("{b:02x}")).collect();
            format!("{:08x}  {}", offset + i * 16, hex.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dump_range() {
        let range = parse_dump_range("64:8").unwrap();
        assert_eq!((range.offset, range.len), (64, 8));

        assert!(parse_dump_range("64").is_err());
        assert!(parse_dump_range("x:8").is_err());
    }

    #[test]
    fn test_hex_dump() {
        let bytes: Vec<u8> = (0..18).collect();
        let dump = hex_dump(32, &bytes);
        let lines: Vec<&str> = dump.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000020  00 01 02"));
        assert_eq!(lines[1], "00000030  10 11");
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "wasm-handoff",
            "run",
            "--module",
            "app.wasm",
            "--work",
            "16",
            "32",
            "--dump",
            "0:4",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.work, vec![16, 32]);
        assert_eq!(args.module, Some(PathBuf::from("app.wasm")));
    }

    #[test]
    fn test_cli_requires_module_or_config() {
        assert!(Cli::try_parse_from(["wasm-handoff", "run", "--work", "1"]).is_err());
    }
}
