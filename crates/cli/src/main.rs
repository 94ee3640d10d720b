use std::collections::BTreeMap;
use std::fs;
use std::io::{stdin, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};
use warden_core::{ExecOptions, Sandbox, SandboxConfig, SandboxError, Template};

#[derive(Parser, Debug)]
#[command(name = "warden", version, about = "Run agent commands inside isolated workspaces", long_about = None)]
struct Cli {
    /// Config file (defaults to WARDEN_CONFIG, ./warden.toml, ./.warden/warden.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error, off). Overrides RUST_LOG if set.
    #[arg(long = "log-level", global = true, value_name = "LEVEL")]
    log_level: Option<String>,
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate and run one command line in a workspace
    Exec {
        #[arg(short, long)]
        workspace: String,
        /// Timeout in seconds (clamped to the configured maximum)
        #[arg(long)]
        timeout: Option<u64>,
        /// Working directory relative to the workspace root
        #[arg(long)]
        cwd: Option<String>,
        /// Extra environment variable, KEY=VALUE
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Discard stdout/stderr instead of capturing them
        #[arg(long)]
        no_capture: bool,
        /// The command line, e.g. `-- pytest -q`
        #[arg(trailing_var_arg = true, required = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run an inline script read from a file or stdin (`-`)
    Script {
        #[arg(short, long)]
        workspace: String,
        /// Script type (python, bash, node, go, c, rust, java, ...)
        #[arg(long = "type", default_value = "python")]
        script_type: String,
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(default_value = "-")]
        source: String,
    },

    /// Check a command line against the policy without running it
    Validate {
        #[arg(short, long)]
        workspace: String,
        #[arg(trailing_var_arg = true, required = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Workspace lifecycle
    #[command(subcommand)]
    Workspace(WorkspaceCommand),
}

#[derive(Subcommand, Debug)]
enum WorkspaceCommand {
    /// Create and scaffold a new workspace
    Create {
        #[arg(long)]
        id: Option<String>,
        /// python, node, rust, go, java or generic
        #[arg(long)]
        template: Option<String>,
    },
    /// Clone or update a repository, then run setup commands
    Setup {
        id: String,
        #[command(flatten)]
        setup: SetupArgs,
    },
    /// Snapshot the workspace into .archive/<session>
    Archive {
        id: String,
        #[arg(long)]
        session: Option<String>,
        /// Leave temp files in the workspace
        #[arg(long)]
        keep_temp: bool,
    },
    /// Copy an archived session back into the workspace
    Restore { id: String, session: String },
    /// Delete the workspace directory
    Cleanup { id: String },
    /// List workspaces under the configured base
    List,
}

#[derive(Args, Debug)]
struct SetupArgs {
    #[arg(long)]
    repo: Option<String>,
    /// Setup command; repeat for several. Template defaults when omitted.
    #[arg(long = "command", value_name = "CMD")]
    commands: Vec<String>,
}

/// Initialize logging based on CLI arguments and environment
fn init_logging(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => match level.to_lowercase().as_str() {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => EnvFilter::new(level.to_lowercase()),
            "warning" => EnvFilter::new("warn"),
            _ => {
                eprintln!("Warning: Invalid log level '{}', using 'info'", level);
                EnvFilter::new("info")
            }
        },
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    // stdout carries the JSON result
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    tracing::debug!("CLI arguments: {:?}", cli);

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            let payload = match err.downcast_ref::<SandboxError>() {
                Some(sandbox_err) => json!({
                    "error": {
                        "code": sandbox_err.error_code(),
                        "category": sandbox_err.category(),
                        "message": sandbox_err.to_string(),
                    }
                }),
                None => json!({ "error": { "code": "E_CLI", "message": format!("{:#}", err) } }),
            };
            if let Err(print_err) = print_json(&payload, cli.pretty) {
                eprintln!("{:#}", print_err);
            }
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = SandboxConfig::load(cli.config.clone())?;
    let sandbox = Sandbox::new(config)?;

    match &cli.command {
        Commands::Exec {
            workspace,
            timeout,
            cwd,
            env,
            no_capture,
            command,
        } => {
            sandbox.open_workspace(workspace)?;
            let options = ExecOptions {
                timeout_secs: *timeout,
                cwd: cwd.clone(),
                env_vars: parse_env(env)?,
                capture_output: Some(!no_capture),
                cancel: None,
            };
            let result = sandbox.execute_command(workspace, &command_line(command), options)?;
            print_json(&result, cli.pretty)?;
            Ok(exit_for(result.success))
        }
        Commands::Script {
            workspace,
            script_type,
            timeout,
            source,
        } => {
            sandbox.open_workspace(workspace)?;
            let content = read_source(source)?;
            let result = sandbox.execute_script(workspace, &content, Some(script_type), *timeout)?;
            print_json(&result, cli.pretty)?;
            Ok(exit_for(result.success))
        }
        Commands::Validate { workspace, command } => {
            sandbox.open_workspace(workspace)?;
            let verdict = sandbox.validate_command(workspace, &command_line(command))?;
            print_json(&verdict, cli.pretty)?;
            Ok(exit_for(verdict.allowed))
        }
        Commands::Workspace(sub) => run_workspace(&sandbox, sub, cli.pretty),
    }
}

fn run_workspace(sandbox: &Sandbox, command: &WorkspaceCommand, pretty: bool) -> Result<ExitCode> {
    match command {
        WorkspaceCommand::Create { id, template } => {
            let template = template
                .as_deref()
                .map(str::parse::<Template>)
                .transpose()?;
            let workspace = sandbox.create_workspace(id.as_deref(), template, None)?;
            print_json(&workspace, pretty)?;
        }
        WorkspaceCommand::Setup { id, setup } => {
            sandbox.open_workspace(id)?;
            let result = sandbox.setup_workspace(id, setup.repo.as_deref(), &setup.commands)?;
            print_json(&result, pretty)?;
            return Ok(exit_for(result.success));
        }
        WorkspaceCommand::Archive {
            id,
            session,
            keep_temp,
        } => {
            sandbox.open_workspace(id)?;
            let manifest = sandbox.archive_session_work(id, session.as_deref(), !keep_temp)?;
            print_json(&manifest, pretty)?;
        }
        WorkspaceCommand::Restore { id, session } => {
            sandbox.open_workspace(id)?;
            let restored = sandbox.restore_session(id, session)?;
            print_json(&restored, pretty)?;
        }
        WorkspaceCommand::Cleanup { id } => {
            let removed = sandbox.cleanup_workspace(id);
            print_json(&json!({ "workspace_id": id, "removed": removed }), pretty)?;
            return Ok(exit_for(removed));
        }
        WorkspaceCommand::List => {
            let workspaces = sandbox.discover_workspaces()?;
            print_json(&workspaces, pretty)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Rejoin a trailing argv into the command line the validator lexes.
fn command_line(parts: &[String]) -> String {
    if parts.len() == 1 {
        parts[0].clone()
    } else {
        shell_words::join(parts)
    }
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --env '{}': expected KEY=VALUE", pair);
        };
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn read_source(source: &str) -> Result<String> {
    if source == "-" {
        let mut content = String::new();
        stdin()
            .read_to_string(&mut content)
            .context("read script from stdin")?;
        Ok(content)
    } else {
        fs::read_to_string(source).with_context(|| format!("read script '{}'", source))
    }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

fn exit_for(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_argument_is_taken_verbatim() {
        assert_eq!(command_line(&["pytest -q tests".into()]), "pytest -q tests");
        assert_eq!(
            command_line(&["echo".into(), "two words".into()]),
            "echo 'two words'"
        );
    }

    #[test]
    fn env_pairs_need_an_equals_sign() {
        let env = parse_env(&["A=1".into(), "B=x=y".into()]).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "x=y");
        assert!(parse_env(&["NOPE".into()]).is_err());
    }

    #[test]
    fn cli_parses_trailing_command() {
        let cli = Cli::try_parse_from(["warden", "exec", "-w", "ws", "--", "ls", "-la"]).unwrap();
        match cli.command {
            Commands::Exec { workspace, command, .. } => {
                assert_eq!(workspace, "ws");
                assert_eq!(command, ["ls", "-la"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
