mod logging;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use prep_core::{ConfigurationError, PrepError, RawParameterSet, RawValue};
use prep_records::FileRecordStore;
use prep_runner::{
    load_config, load_metadata, registry::serialize_parameters, PrepOptions, PreparedRun,
    Preparer, RunContext, RunRequest, WorkflowRegistry,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Parser)]
#[command(name = "prep", version = "0.3.0", about = "Run preparation and provenance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve parameters, set up the run directory, register and write metadata.
    Prepare {
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        params: Option<PathBuf>,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        from_metadata: Option<PathBuf>,
        #[arg(long)]
        no_register: bool,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Workflows {
        #[arg(long = "type")]
        flow_type: Option<String>,
        #[arg(long)]
        json: bool,
    },
    ShowMetadata {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&error_payload(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Prepare {
            workflow,
            run_id,
            params,
            set_values,
            from_metadata,
            no_register,
            config,
            json,
        } => {
            let config = load_config(config.as_deref())?;
            let mut flat = RawParameterSet::new();
            let mut workflow_name = workflow;
            if let Some(path) = &from_metadata {
                let doc = load_metadata(path)?;
                if workflow_name.is_none() {
                    workflow_name = Some(doc.workflow_name.clone());
                }
                flat.extend(doc.into_parameters());
            }
            if let Some(path) = &params {
                flat.extend(read_params_file(path)?);
            }
            for (key, value) in parse_set_bindings(&set_values)? {
                flat.insert(key, RawValue::Json(value));
            }
            let workflow_name = workflow_name
                .ok_or_else(|| anyhow!("--workflow is required unless --from-metadata is given"))?;
            debug!(workflow = %workflow_name, parameters = flat.len(), "request assembled");

            let registry = WorkflowRegistry::builtin();
            let store = FileRecordStore::open(&config.store_dir)?;
            let preparer = Preparer::new(&registry, &store, &config);
            let request = RunRequest::from_flat(flat, &config.derived_override_prefix)
                .map_err(PrepError::from)?;
            let run = preparer.prepare(
                &RunContext::new(workflow_name, run_id),
                &request,
                &PrepOptions {
                    register_run: !no_register,
                },
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "prepare",
                    "run": prepared_run_to_json(&run)?,
                })));
            }
            print_prepared_run(&run);
        }
        Commands::Workflows { flow_type, json } => {
            let registry = WorkflowRegistry::builtin();
            let names = match &flow_type {
                Some(t) => registry.list_by_type(t).map_err(PrepError::from)?,
                None => registry.list_all(),
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "workflows",
                    "type": flow_type,
                    "workflows": names,
                })));
            }
            for name in names {
                println!("{}", name);
            }
        }
        Commands::ShowMetadata { path, json } => {
            let doc = load_metadata(&path)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show-metadata",
                    "path": path.display().to_string(),
                    "metadata": serde_json::to_value(&doc)?,
                })));
            }
            println!("workflow_name: {}", doc.workflow_name);
            println!("run_id: {}", doc.run_id);
            for (key, value) in &doc.parameters {
                println!("{}: {}", key, value);
            }
        }
    }
    Ok(None)
}

fn read_params_file(path: &Path) -> Result<RawParameterSet> {
    let raw_yaml =
        fs::read_to_string(path).with_context(|| format!("read params {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)
        .with_context(|| format!("parse params {}", path.display()))?;
    match serde_json::to_value(yaml_value)? {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| (key, RawValue::Json(value)))
            .collect()),
        Value::Null => Ok(RawParameterSet::new()),
        _ => Err(anyhow!(
            "params file {} must contain a mapping",
            path.display()
        )),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_payload(err: &anyhow::Error) -> Value {
    if let Some(prep) = err.downcast_ref::<PrepError>() {
        return json_error(
            prep.code(),
            prep.to_string(),
            json!({ "stage": prep.stage().as_str() }),
        );
    }
    if let Some(config) = err.downcast_ref::<ConfigurationError>() {
        return json_error(
            "configuration_error",
            config.to_string(),
            json!({ "stage": config.stage().as_str() }),
        );
    }
    json_error("command_failed", format!("{:#}", err), json!({}))
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Prepare { json, .. }
        | Commands::Workflows { json, .. }
        | Commands::ShowMetadata { json, .. } => *json,
    }
}

fn prepared_run_to_json(run: &PreparedRun) -> Result<Value> {
    let parameters = serialize_parameters(&run.parameters).map_err(PrepError::from)?;
    Ok(json!({
        "workflow_name": run.workflow_name,
        "run_id": run.run_id,
        "directory": run.directory.path.display().to_string(),
        "directory_state": run.directory.state.as_str(),
        "primary_input": run.primary_input.as_ref().map(|p| p.field.clone()),
        "source": run.source.as_ref().and_then(RawValue::to_json),
        "record_id": run.record.as_ref().map(|r| r.record_id.clone()),
        "record_created": run.record_created,
        "metadata": run.metadata_path.display().to_string(),
        "parameters": parameters,
    }))
}

fn print_prepared_run(run: &PreparedRun) {
    println!("workflow: {}", run.workflow_name);
    println!("run_id: {}", run.run_id);
    println!(
        "directory: {} ({})",
        run.directory.path.display(),
        run.directory.state.as_str()
    );
    match &run.primary_input {
        Some(primary) => println!("primary_input: {}", primary.field),
        None => println!("primary_input: none"),
    }
    match &run.source {
        Some(source) => println!("source: {}", source),
        None => println!("source: none"),
    }
    match &run.record {
        Some(record) if run.record_created => println!("record: {} (created)", record.record_id),
        Some(record) => println!("record: {} (loaded)", record.record_id),
        None => println!("record: none"),
    }
    println!("metadata: {}", run.metadata_path.display());
}

fn parse_set_bindings(values: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected k=v", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid --set '{}': key cannot be empty", raw));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.insert(key.trim().to_string(), parsed);
    }
    Ok(out)
}
