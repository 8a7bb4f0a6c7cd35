use std::path::Path;

use chrono::{DateTime, Local, Utc};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::info;

use crate::analysis::SecurityAnalysisReport;
use crate::cli::args::{
    AnalyzeArgs, ConfigAction, ConfigArgs, ExecArgs, InitArgs, OutputFormat, ParseArgs, ReplArgs,
};
use crate::config::loader::get_config_path;
use crate::config::types::SandkitConfig;
use crate::error::{Result, SandkitError};
use crate::sandbox::{
    ExecutionEngine, ExecutionRequest, ExecutionResult, FieldTypeValidator, SandboxBackend,
    Validator,
};
use crate::session::SessionOptions;

/// Exit code for a run that failed inside the sandbox
pub const EXIT_RUN_FAILED: i32 = 1;
/// Exit code for an analysis whose risk level is high or critical
pub const EXIT_HIGH_RISK: i32 = 2;

// ============================================================================
// Execution Commands
// ============================================================================

/// Execute a one-shot snippet in a pooled sandbox
pub async fn exec(args: ExecArgs, engine: &ExecutionEngine, format: OutputFormat) -> Result<i32> {
    let code = read_input(args.code, args.file.as_deref()).await?;
    info!(language = %args.language, chars = code.chars().count(), "Executing snippet");

    let mut request = ExecutionRequest::new(code).language(args.language);
    if let Some(mb) = args.memory_mb {
        request = request.memory_limit_mb(mb);
    }
    if let Some(ms) = args.timeout_ms {
        request = request.timeout_ms(ms);
    }
    for (name, value) in args.globals {
        request = request.global(name, value);
    }

    let result = engine.execute(request).await?;
    output_execution_result(&result, &format)
}

/// Parse JSON inside the sandbox, checking any required field types
pub async fn parse(args: ParseArgs, engine: &ExecutionEngine, format: OutputFormat) -> Result<i32> {
    let text = read_input(args.text, args.file.as_deref()).await?;
    info!(requirements = args.requirements.len(), "Parsing structured data");

    let validator = if args.requirements.is_empty() {
        None
    } else {
        let validator = args
            .requirements
            .into_iter()
            .fold(FieldTypeValidator::new(), |v, (field, kind)| v.require(field, kind));
        Some(validator)
    };

    let result = engine
        .execute_parsed_data(&text, validator.as_ref().map(|v| v as &dyn Validator))
        .await?;
    output_execution_result(&result, &format)
}

/// Read snippets line by line and run each one
pub async fn repl(args: ReplArgs, engine: &ExecutionEngine, format: OutputFormat) -> Result<i32> {
    let session = if args.fresh {
        None
    } else {
        let mut options = SessionOptions::new();
        if let Some(mb) = args.memory_mb {
            options = options.memory_limit_mb(mb);
        }
        Some(engine.open_session(options).await?)
    };

    let backend: &dyn SandboxBackend = match &session {
        Some(session) => session,
        None => engine,
    };
    let info = backend.info();
    info!(
        backend = backend.name(),
        instance = ?info.instance_id,
        "Reading snippets from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match backend.run(line, args.timeout_ms).await {
            Ok(result) => {
                output_execution_result(&result, &format)?;
            }
            Err(e @ SandkitError::SessionDisposed { .. }) => return Err(e),
            Err(e) => eprintln!("error: {}", e),
        }
    }

    if let Some(session) = &session {
        session.dispose().await;
    }
    Ok(0)
}

// ============================================================================
// Analysis Command
// ============================================================================

pub async fn analyze(
    args: AnalyzeArgs,
    engine: &ExecutionEngine,
    config: &SandkitConfig,
    format: OutputFormat,
) -> Result<i32> {
    let code = if args.path.as_os_str() == "-" {
        let mut buffer = String::new();
        tokio::io::stdin().read_to_string(&mut buffer).await?;
        buffer
    } else {
        tokio::fs::read_to_string(&args.path).await?
    };

    let language = args
        .language
        .unwrap_or_else(|| config.analyzer.default_language.clone());
    let report = engine.analyze(&code, Some(&language));
    info!(
        findings = report.finding_count,
        risk_score = report.risk_score,
        "Analysis complete"
    );

    output_report(&report, &format)?;
    Ok(if report.is_high_risk() { EXIT_HIGH_RISK } else { 0 })
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    // Create parent directories if needed
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let default_config = SandkitConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| SandkitError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Run a snippet");
    println!("  sandkit exec \"[1, 2, 3].map(n => n * 2)\"");
    println!();
    println!("  # Parse untrusted JSON and require a string field");
    println!("  sandkit parse '{{\"name\": \"x\"}}' --require name:string");
    println!();
    println!("  # Score a file for dangerous constructs");
    println!("  sandkit analyze ./payload.js");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: SandkitConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| SandkitError::Config(e.to_string()))?;
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

async fn read_input(inline: Option<String>, file: Option<&Path>) -> Result<String> {
    match (inline, file) {
        (Some(text), _) => Ok(text),
        (None, Some(path)) => Ok(tokio::fs::read_to_string(path).await?),
        (None, None) => Err(SandkitError::Config(
            "Provide the input inline or with --file".to_string(),
        )),
    }
}

fn output_execution_result(result: &ExecutionResult, format: &OutputFormat) -> Result<i32> {
    match format {
        OutputFormat::Text => {
            for entry in &result.logs {
                eprintln!(
                    "{} [{}] {}",
                    format_timestamp(&entry.timestamp),
                    entry.level,
                    entry.message
                );
            }
            if result.success {
                let value = result.result.clone().unwrap_or(serde_json::Value::Null);
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else if let Some(error) = &result.error {
                eprintln!("error: {}", error);
            }
            info!(
                elapsed_ms = result.execution_time_ms,
                memory_used = result.memory_used,
                memory_limit = result.memory_limit,
                "Run finished"
            );
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
    }
    Ok(if result.success { 0 } else { EXIT_RUN_FAILED })
}

fn output_report(report: &SecurityAnalysisReport, format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!(
                "Risk: {} (score {}/100), {} finding(s) in {} line(s) [{}]",
                report.risk_level,
                report.risk_score,
                report.finding_count,
                report.lines_analyzed,
                report.language
            );
            for finding in &report.findings {
                println!(
                    "  line {:<5} {:<8} {}",
                    finding.line,
                    finding.severity.to_string(),
                    finding.message
                );
                println!("             {}", finding.excerpt);
            }
        }
        OutputFormat::Json => {
            let mut value = serde_json::to_value(report)?;
            if let Some(object) = value.as_object_mut() {
                object.insert(
                    "findings_by_severity".to_string(),
                    serde_json::to_value(report.findings_by_severity())?,
                );
            }
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(())
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    let local: DateTime<Local> = (*timestamp).into();
    local.format("%H:%M:%S%.3f").to_string()
}
