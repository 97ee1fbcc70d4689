use std::path::PathBuf;
use std::process;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

enum Command {
    Decode(PathBuf),
    Encode { input: PathBuf, output: PathBuf },
}

fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: gb-manifest decode <manifest>");
            eprintln!("       gb-manifest encode <json> -o <manifest>");
            eprintln!();
            eprintln!("Commands:");
            eprintln!("  decode    Print a manifest blob as JSON");
            eprintln!("  encode    Build a manifest blob from a JSON description");
            process::exit(2);
        }
    };

    if let Err(e) = run(command) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut positional = Vec::new();
    let mut output: Option<PathBuf> = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "-o" | "--output" => {
                i += 1;
                output = Some(PathBuf::from(
                    args.get(i).ok_or("--output requires a value")?,
                ));
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = positional.next().ok_or("missing command")?;
    let path = positional
        .next()
        .map(PathBuf::from)
        .ok_or("missing required argument: <file>")?;
    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument: {extra}"));
    }

    match command.as_str() {
        "decode" => {
            if output.is_some() {
                return Err("decode does not take --output".to_string());
            }
            Ok(Command::Decode(path))
        }
        "encode" => {
            let output = output.ok_or("encode requires --output <manifest>")?;
            Ok(Command::Encode {
                input: path,
                output,
            })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Decode(path) => {
            let json = gb_manifest::decode_to_json(&path)?;
            println!("{json}");
        }
        Command::Encode { input, output } => {
            let written = gb_manifest::encode_file(&input, &output)?;
            eprintln!("wrote {written} bytes to {}", output.display());
        }
    }
    Ok(())
}

/// `RUST_LOG` wins; otherwise `GREYBUS_LOG` picks the level (default warn).
/// `LOG_FORMAT=json` switches to JSON lines. Logs go to stderr so decode
/// output stays clean on stdout.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("GREYBUS_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!(
            "greybus={level},gb_manifest={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
