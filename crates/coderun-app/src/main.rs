use anyhow::{anyhow, bail, Context, Result};
use coderun_app::{client_config, executor_set_from_config, pool_config, start_in_process};
use coderun_config::CoderunConfig;
use coderun_protocol::{Language, ProcessEvent};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_cli_flags()?;
    init_logging(cli.log_file.as_deref())?;
    let config = match cli.config.as_deref() {
        Some(path) => coderun_config::load_from_path(path)?,
        None => coderun_config::load_from_env()?,
    };

    match cli.command {
        CliCommand::Run { language, source } => {
            let succeeded = run_source(&config, language, source).await?;
            if !succeeded {
                std::process::exit(1);
            }
        }
        CliCommand::ServeStdio => coderun_app::serve_stdio(&config).await,
    }

    Ok(())
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create log directory '{}'", parent.display())
                    })?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file '{}'", path.display()))?;
            builder.with_writer(std::sync::Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }

    Ok(())
}

/// Streams the run to stdout/stderr, forwarding terminal input as
/// interaction. Returns `false` if the run reported error output.
async fn run_source(config: &CoderunConfig, language: Language, source: SourceArg) -> Result<bool> {
    let (code, forward_stdin) = match source {
        SourceArg::File(path) => (
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read source file '{}'", path.display()))?,
            true,
        ),
        SourceArg::Stdin => {
            let mut code = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut code)
                .context("failed to read source from stdin")?;
            (code, false)
        }
    };

    let runner = start_in_process(
        executor_set_from_config(&config.languages),
        pool_config(config),
        client_config(config),
    );
    let request = runner.run_code(language, code);
    let (controls, mut events) = request.into_parts();

    let stdin_task = forward_stdin.then(|| {
        let controls = controls.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                controls.interact(format!("{line}\n"));
            }
        })
    });

    let mut reported_errors = false;
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Output(data) => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(data.as_bytes())?;
                stdout.flush()?;
            }
            ProcessEvent::Error(data) => {
                reported_errors = true;
                let mut stderr = std::io::stderr().lock();
                stderr.write_all(data.as_bytes())?;
                stderr.flush()?;
            }
            ProcessEvent::Halt(message) => {
                tracing::info!(key = %controls.key(), exit = %message, "run finished");
                break;
            }
        }
    }

    if let Some(task) = stdin_task {
        task.abort();
    }
    runner.shutdown();
    Ok(!reported_errors)
}

#[derive(Debug)]
enum SourceArg {
    File(PathBuf),
    Stdin,
}

#[derive(Debug)]
enum CliCommand {
    Run { language: Language, source: SourceArg },
    ServeStdio,
}

#[derive(Debug)]
struct CliFlags {
    config: Option<PathBuf>,
    log_file: Option<PathBuf>,
    command: CliCommand,
}

fn parse_cli_flags() -> Result<CliFlags> {
    parse_cli_args(std::env::args().skip(1))
}

fn parse_cli_args(args: impl IntoIterator<Item = String>) -> Result<CliFlags> {
    let mut config = None;
    let mut log_file = None;
    let mut command = None;
    let mut language = None;
    let mut source = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config = Some(PathBuf::from(read_cli_value(&arg, args.next())?));
            }
            "--log-file" => {
                log_file = Some(PathBuf::from(read_cli_value(&arg, args.next())?));
            }
            "--language" | "-l" => {
                let value = read_cli_value(&arg, args.next())?;
                language = Some(value.parse::<Language>()?);
            }
            "--help" | "-h" => {
                print_cli_help();
                std::process::exit(0);
            }
            "run" | "serve-stdio" if command.is_none() => command = Some(arg.clone()),
            "-" if command.as_deref() == Some("run") && source.is_none() => {
                source = Some(SourceArg::Stdin);
            }
            value if value.starts_with('-') => {
                bail!("Unknown flag '{value}'. Run with --help for valid flags.");
            }
            path if command.as_deref() == Some("run") && source.is_none() => {
                source = Some(SourceArg::File(PathBuf::from(path)));
            }
            unknown => {
                bail!("Unexpected argument '{unknown}'. Run with --help for valid flags.");
            }
        }
    }

    let command = match command.as_deref() {
        Some("run") => CliCommand::Run {
            language: language.ok_or_else(|| {
                anyhow!("Missing --language. Use --language <python|scheme|sql|lark>.")
            })?,
            source: source.unwrap_or(SourceArg::Stdin),
        },
        Some(_) => {
            if language.is_some() {
                bail!("--language is only valid with the run command.");
            }
            CliCommand::ServeStdio
        }
        None => bail!("Missing command. Run with --help for usage."),
    };

    Ok(CliFlags {
        config,
        log_file,
        command,
    })
}

fn print_cli_help() {
    println!("Usage: coderun [--config <path>] [--log-file <path>] <command>");
    println!();
    println!("Commands:");
    println!("  run --language <lang> [<file>|-]   Run source once and stream its output");
    println!("  serve-stdio                        Serve executor envelopes over stdin/stdout");
    println!();
    println!("  --config <path>     Configuration file (defaults to $CODERUN_CONFIG)");
    println!("  --log-file <path>   Write logs to a file instead of stderr");
    println!("  --help              Show this help message");
}

fn read_cli_value(flag: &str, value: Option<String>) -> Result<String> {
    let value = value.ok_or_else(|| anyhow!("Missing value after {flag}."))?;
    let value = value.trim();
    if value.is_empty() {
        bail!("Flag '{flag}' requires a non-empty value.");
    }
    Ok(value.to_owned())
}
