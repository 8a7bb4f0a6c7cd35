use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;

use crate::sandbox::{JsonType, Language};

#[derive(Parser, Debug)]
#[clap(name = "sandkit")]
#[clap(version, about = "Sandboxed script execution and static risk analysis")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "SANDKIT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a snippet in a pooled sandbox
    Exec(ExecArgs),

    /// Parse a JSON document inside the sandbox, optionally checking field types
    Parse(ParseArgs),

    /// Statically score code for dangerous constructs
    Analyze(AnalyzeArgs),

    /// Read snippets from stdin and run them one per line
    Repl(ReplArgs),

    /// Initialize a new sandkit configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Execution Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Code to execute (omit when using --file)
    #[clap(required_unless_present = "file")]
    pub code: Option<String>,

    /// Read the code from a file
    #[clap(long, short = 'f', conflicts_with = "code")]
    pub file: Option<PathBuf>,

    /// Source language
    #[clap(long, short = 'l', default_value = "javascript", value_parser = parse_language)]
    pub language: Language,

    /// Memory ceiling in MB (8-512)
    #[clap(long)]
    pub memory_mb: Option<u32>,

    /// Time budget in milliseconds (100-30000)
    #[clap(long)]
    pub timeout_ms: Option<u64>,

    /// Inject a global into the sandbox (NAME=JSON)
    #[clap(long = "global", short = 'g', value_parser = parse_global)]
    pub globals: Vec<(String, Value)>,
}

#[derive(Args, Debug)]
pub struct ParseArgs {
    /// JSON text to parse (omit when using --file)
    #[clap(required_unless_present = "file")]
    pub text: Option<String>,

    /// Read the JSON text from a file
    #[clap(long, short = 'f', conflicts_with = "text")]
    pub file: Option<PathBuf>,

    /// Require a field of the given type (FIELD:TYPE, e.g. name:string)
    #[clap(long = "require", short = 'r', value_parser = parse_requirement)]
    pub requirements: Vec<(String, JsonType)>,
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// File to analyze, or - for stdin
    pub path: PathBuf,

    /// Language tag (defaults to the configured analyzer language)
    #[clap(long, short = 'l')]
    pub language: Option<String>,
}

#[derive(Args, Debug)]
pub struct ReplArgs {
    /// Run every line in a fresh pooled sandbox instead of one persistent session
    #[clap(long)]
    pub fresh: bool,

    /// Memory ceiling for the session in MB (8-512)
    #[clap(long, conflicts_with = "fresh")]
    pub memory_mb: Option<u32>,

    /// Time budget per line in milliseconds (100-30000)
    #[clap(long)]
    pub timeout_ms: Option<u64>,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

fn parse_language(s: &str) -> Result<Language, String> {
    s.parse().map_err(|e: crate::error::SandkitError| e.to_string())
}

fn parse_global(s: &str) -> Result<(String, Value), String> {
    // Format: NAME=JSON
    let (name, json) = s
        .split_once('=')
        .ok_or_else(|| "Global format: NAME=JSON".to_string())?;
    let value = serde_json::from_str(json)
        .map_err(|e| format!("Global '{}' is not valid JSON: {}", name, e))?;
    Ok((name.to_string(), value))
}

fn parse_requirement(s: &str) -> Result<(String, JsonType), String> {
    crate::sandbox::FieldTypeValidator::parse_requirement(s).map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global() {
        let (name, value) = parse_global(r#"target={"host":"a"}"#).unwrap();
        assert_eq!(name, "target");
        assert_eq!(value["host"], "a");
        assert!(parse_global("novalue").is_err());
        assert!(parse_global("x={bad").is_err());
    }

    #[test]
    fn test_cli_parses_exec() {
        let cli = Cli::try_parse_from([
            "sandkit",
            "exec",
            "1 + 1",
            "--timeout-ms",
            "250",
            "-g",
            "n=3",
        ])
        .unwrap();
        match cli.command {
            Commands::Exec(args) => {
                assert_eq!(args.code.as_deref(), Some("1 + 1"));
                assert_eq!(args.timeout_ms, Some(250));
                assert_eq!(args.globals.len(), 1);
                assert_eq!(args.language, Language::Javascript);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_requirements() {
        let cli = Cli::try_parse_from(["sandkit", "parse", "{}", "-r", "id:number"]).unwrap();
        match cli.command {
            Commands::Parse(args) => {
                assert_eq!(args.requirements, vec![("id".to_string(), JsonType::Number)]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
