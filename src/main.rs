/// Replayflow - Continuation Bytecode Rewriter CLI
use replayflow::backend::batch::BatchRewriter;
use replayflow::backend::bytecode::{decode_type, TypeDef};
use replayflow::config::{FailMode, FlowConfig};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use tracing::Level;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("Replayflow v{}", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    replayflow [OPTIONS] rewrite <DIR>");
    eprintln!("    replayflow [OPTIONS] disasm <FILE>");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help              Print this help message");
    eprintln!("    -V, --version           Print version information");
    eprintln!("    -v                      More log output (repeatable)");
    eprintln!("    -q                      Only log errors");
    eprintln!("    -o, --output <DIR>      Write rewritten tree to DIR (default: in place)");
    eprintln!("    --classpath <DIR>       Directory of referenced units (repeatable)");
    eprintln!("    --fail-closed           Abort on the first unit that cannot be rewritten");
    eprintln!("    --config <FILE>         Read settings from FILE (default: ./replayflow.toml)");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    replayflow rewrite build/units");
    eprintln!("    replayflow rewrite build/units -o build/rewritten --classpath lib/units");
    eprintln!("    replayflow disasm build/units/demo/Counter.flow");
}

fn print_version() {
    println!("Replayflow {}", VERSION);
}

enum Command {
    Rewrite(PathBuf),
    Disasm(PathBuf),
}

struct Options {
    command: Command,
    output: Option<PathBuf>,
    classpath: Vec<PathBuf>,
    fail_closed: bool,
    config: Option<PathBuf>,
    verbosity: i32,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();

    let mut positional = Vec::new();
    let mut output = None;
    let mut classpath = Vec::new();
    let mut fail_closed = false;
    let mut config = None;
    let mut verbosity = 0;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-V" | "--version" => {
                print_version();
                process::exit(0);
            }
            "-v" => verbosity += 1,
            "-vv" => verbosity += 2,
            "-q" | "--quiet" => verbosity = -1,
            "-o" | "--output" => {
                i += 1;
                let dir = args.get(i).ok_or("Missing directory after -o")?;
                output = Some(PathBuf::from(dir));
            }
            "--classpath" => {
                i += 1;
                let dir = args.get(i).ok_or("Missing directory after --classpath")?;
                classpath.push(PathBuf::from(dir));
            }
            "--fail-closed" => fail_closed = true,
            "--config" => {
                i += 1;
                let file = args.get(i).ok_or("Missing file after --config")?;
                config = Some(PathBuf::from(file));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let command = match positional.as_slice() {
        [cmd, dir] if cmd == "rewrite" => Command::Rewrite(PathBuf::from(dir)),
        [cmd, file] if cmd == "disasm" => Command::Disasm(PathBuf::from(file)),
        [] => return Err("Missing command".to_string()),
        [cmd, ..] if cmd != "rewrite" && cmd != "disasm" => return Err(format!("Unknown command: {}", cmd)),
        _ => return Err("Expected exactly one path after the command".to_string()),
    };

    Ok(Options {
        command,
        output,
        classpath,
        fail_closed,
        config,
        verbosity,
    })
}

fn init_logging(config: &FlowConfig, verbosity: i32) -> Result<(), String> {
    let base = config.log.level().map_err(|e| e.to_string())?;
    let level = match verbosity {
        v if v < 0 => Level::ERROR,
        0 => base,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
    Ok(())
}

fn load_config(options: &Options) -> Result<FlowConfig, String> {
    let mut config = match &options.config {
        Some(path) => FlowConfig::load(path),
        None => FlowConfig::discover(Path::new(".")),
    }
    .map_err(|e| e.to_string())?;
    if options.fail_closed {
        config.transform.fail_mode = FailMode::Closed;
    }
    Ok(config)
}

fn rewrite(dir: &Path, options: &Options, config: FlowConfig) -> Result<bool, String> {
    let mut rewriter = BatchRewriter::new(config.transform, config.batch);
    for entry in &options.classpath {
        rewriter = rewriter.classpath(entry);
    }
    let report = rewriter
        .rewrite(dir, options.output.as_deref())
        .map_err(|e| e.to_string())?;

    println!(
        "{} units: {} rewritten, {} unchanged, {} failed; {} other files copied",
        report.units(),
        report.rewritten.len(),
        report.unchanged.len(),
        report.failed.len(),
        report.copied
    );
    for (name, err) in &report.failed {
        println!("  kept unchanged: {} ({})", name, err);
    }
    Ok(report.is_clean())
}

fn disasm(file: &Path) -> Result<(), String> {
    let bytes = fs::read(file).map_err(|e| format!("Cannot read {}: {}", file.display(), e))?;
    let def = decode_type(&bytes).map_err(|e| format!("{}: {}", file.display(), e))?;
    print!("{}", render_type(&def));
    Ok(())
}

fn render_type(def: &TypeDef) -> String {
    let mut out = String::new();
    let kind = if def.is_interface { "interface" } else { "type" };
    out.push_str(&format!("{} {}", kind, def.name));
    if let Some(super_type) = &def.super_type {
        out.push_str(&format!(" extends {}", super_type));
    }
    if !def.interfaces.is_empty() {
        let names: Vec<&str> = def.interfaces.iter().map(|i| &**i).collect();
        out.push_str(&format!(" implements {}", names.join(", ")));
    }
    if def.continuable {
        out.push_str(" [continuable]");
    }
    if def.sealed {
        out.push_str(" [sealed]");
    }
    if def.instrumented {
        out.push_str(" [instrumented]");
    }
    out.push('\n');

    for method in &def.methods {
        out.push('\n');
        let mut flags = Vec::new();
        if method.is_static {
            flags.push("static");
        }
        if method.is_abstract {
            flags.push("abstract");
        }
        if method.continuable {
            flags.push("continuable");
        }
        out.push_str(&format!("  {} -> {:?}", method.sig.key(), method.sig.returns));
        if !flags.is_empty() {
            out.push_str(&format!(" [{}]", flags.join(", ")));
        }
        out.push('\n');
        if let Some(table) = &method.call_sites {
            out.push_str(&format!("  call sites (version {:016x}): {:?}\n", table.version, table.sites));
        }
        if let Some(body) = &method.body {
            for line in body.disassemble().lines() {
                out.push_str("    ");
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

fn main() {
    let options = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    let config = match load_config(&options) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config, options.verbosity) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    let result = match &options.command {
        Command::Rewrite(dir) => rewrite(dir, &options, config),
        Command::Disasm(file) => disasm(file).map(|()| true),
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(2),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
