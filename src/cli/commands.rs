use std::io::Read;
use std::path::Path;

use tracing::info;

use crate::cli::args::{
    ConfigAction, ConfigArgs, InitArgs, OutputFormat, ReplArgs, RunArgs, SandboxOpts,
};
use crate::config::loader::{get_config_path, write_default_config};
use crate::config::types::CodeletConfig;
use crate::error::{CodeletError, Result};
use crate::executor::{ExecutionResult, RemoteExecutor, ToolSource};
use crate::sandbox::available_backends;

/// Line that separates snippets read by `repl`.
const SNIPPET_SEPARATOR: &str = "%%";

// ============================================================================
// Execution Commands
// ============================================================================

/// Submit each file as one snippet, stopping at the first final answer
pub fn run(args: RunArgs, config: CodeletConfig, format: OutputFormat) -> Result<()> {
    let mut snippets = Vec::with_capacity(args.files.len());
    for path in &args.files {
        snippets.push(std::fs::read_to_string(path)?);
    }

    let mut executor = start_executor(&args.sandbox, config)?;
    for (path, code) in args.files.iter().zip(&snippets) {
        info!(file = %path.display(), "Submitting snippet");
        let result = executor.submit(code)?;
        output_execution_result(&result, format);
        if result.is_final_answer() {
            break;
        }
    }
    executor.delete();
    Ok(())
}

/// Read `%%`-separated snippets from stdin into one session
pub fn repl(args: ReplArgs, config: CodeletConfig, format: OutputFormat) -> Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let mut executor = start_executor(&args.sandbox, config)?;
    for code in split_snippets(&input) {
        match executor.submit(&code) {
            Ok(result) => {
                output_execution_result(&result, format);
                if result.is_final_answer() {
                    break;
                }
            }
            // The interpreter survives these; report and keep going
            Err(e) if e.is_recoverable() => output_error(&e, format),
            Err(e) => return Err(e),
        }
    }
    executor.delete();
    Ok(())
}

/// List sandbox backends and whether they can be used
pub fn backends(config: CodeletConfig, format: OutputFormat) -> Result<()> {
    let backends = available_backends(&config);

    match format {
        OutputFormat::Text => {
            println!("{:<10} {:<10} DESCRIPTION", "BACKEND", "AVAILABLE");
            println!("{}", "-".repeat(50));
            for backend in backends {
                let available = if backend.available { "yes" } else { "no" };
                let reason = backend
                    .unavailable_reason
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default();
                println!(
                    "{:<10} {:<10} {}{}",
                    backend.name, available, backend.description, reason
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&backends)?);
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub fn init(args: InitArgs, config_path: Option<&Path>) -> Result<()> {
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(get_config_path);

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    write_default_config(&config_path, args.force)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Check which sandboxes are usable");
    println!("  codelet backends");
    println!();
    println!("  # Run scripts in one persistent interpreter");
    println!("  codelet run setup.py analysis.py --import pandas");
    println!();
    println!("  # Feed snippets interactively, separated by %% lines");
    println!("  codelet repl --backend docker");

    Ok(())
}

pub fn config(args: ConfigArgs, config: CodeletConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str =
                toml::to_string_pretty(&config).map_err(|e| CodeletError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn start_executor(opts: &SandboxOpts, mut config: CodeletConfig) -> Result<RemoteExecutor> {
    config.docker.mounts.extend(opts.mounts.iter().cloned());
    config.docker.env_vars.extend(opts.env_vars.iter().cloned());

    let tools = load_tools(&opts.tools)?;
    let mut builder = RemoteExecutor::builder(config)
        .additional_imports(opts.imports.iter().cloned())
        .tools(tools);
    if let Some(backend) = opts.backend {
        builder = builder.backend(backend);
    }
    let mut executor = builder.build()?;

    if let Some(path) = &opts.vars {
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<serde_json::Value>(&content)? {
            serde_json::Value::Object(variables) => executor.send_variables(&variables)?,
            _ => {
                return Err(CodeletError::Config(format!(
                    "{} must contain a JSON object",
                    path.display()
                )))
            }
        }
    }

    Ok(executor)
}

fn load_tools(paths: &[std::path::PathBuf]) -> Result<Vec<ToolSource>> {
    paths
        .iter()
        .map(|path| {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok(ToolSource::new(name, std::fs::read_to_string(path)?))
        })
        .collect()
}

/// Split `input` on lines holding only the separator, dropping blank snippets.
fn split_snippets(input: &str) -> Vec<String> {
    let mut snippets = Vec::new();
    let mut current = String::new();
    for line in input.lines() {
        if line.trim() == SNIPPET_SEPARATOR {
            snippets.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    snippets.push(current);
    snippets.retain(|s| !s.trim().is_empty());
    snippets
}

fn output_execution_result(result: &ExecutionResult, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            if !result.logs().is_empty() {
                print!("{}", result.logs());
            }
            if result.is_final_answer() {
                println!("Final answer: {}", result.output());
            } else if !result.output().is_none() {
                println!("Out: {}", result.output());
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "output": result.output().to_json(),
                    "logs": result.logs(),
                    "is_final_answer": result.is_final_answer(),
                })
            );
        }
    }
}

fn output_error(error: &CodeletError, format: OutputFormat) {
    match format {
        OutputFormat::Text => eprintln!("{}", error),
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "error": error.to_string() }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_snippets() {
        let input = "a = 2\n%%\nprint(a + 1)\n  %%  \n\n%%\nfinal_answer(a)";
        assert_eq!(
            split_snippets(input),
            vec!["a = 2\n", "print(a + 1)\n", "final_answer(a)\n"]
        );
        assert!(split_snippets("").is_empty());
    }

    #[test]
    fn test_load_tools_names_by_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helpers.py");
        std::fs::write(&path, "def double(x):\n    return 2 * x\n").unwrap();

        let tools = load_tools(&[path]).unwrap();
        assert_eq!(tools[0].name, "helpers");
        assert!(tools[0].source.contains("def double"));

        assert!(load_tools(&[dir.path().join("missing.py")]).is_err());
    }
}
