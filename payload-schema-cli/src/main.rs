//! Thin command-line wrapper around the payload-schema codec.
//!
//! Exit codes: 0 on success, 1 on a decode/encode/validation failure, 2 on
//! an invalid schema.

use anyhow::{anyhow, Context, Result};
use argh::FromArgs;
use payload_schema::{
    build_schema, load_schema_binary, Metadata, Record, Schema, SchemaDef, Value,
};
use std::path::{Path, PathBuf};

#[derive(FromArgs, Debug)]
/// Schema-driven binary payload codec.
struct Cli {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Decode(DecodeCmd),
    Encode(EncodeCmd),
    Validate(ValidateCmd),
    Score(ScoreCmd),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "decode")]
/// Decode a hex payload into a JSON record.
struct DecodeCmd {
    /// schema file (YAML, or compact binary with --binary)
    #[argh(option, short = 's')]
    schema: PathBuf,
    /// treat the schema file as the compact binary format
    #[argh(switch)]
    binary: bool,
    /// transport port, for schemas that route by port
    #[argh(option)]
    port: Option<u32>,
    /// payload as hex text
    #[argh(positional)]
    payload: String,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "encode")]
/// Encode a JSON record into hex bytes.
struct EncodeCmd {
    /// schema file (YAML, or compact binary with --binary)
    #[argh(option, short = 's')]
    schema: PathBuf,
    /// treat the schema file as the compact binary format
    #[argh(switch)]
    binary: bool,
    /// transport port, for schemas that route by port
    #[argh(option)]
    port: Option<u32>,
    /// record as JSON text
    #[argh(positional)]
    record: String,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "validate")]
/// Run the schema's embedded test vectors.
struct ValidateCmd {
    /// schema file (YAML)
    #[argh(option, short = 's')]
    schema: PathBuf,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "score")]
/// Decode a payload and report its quality share.
struct ScoreCmd {
    /// schema file (YAML, or compact binary with --binary)
    #[argh(option, short = 's')]
    schema: PathBuf,
    /// treat the schema file as the compact binary format
    #[argh(switch)]
    binary: bool,
    /// transport port, for schemas that route by port
    #[argh(option)]
    port: Option<u32>,
    /// payload as hex text
    #[argh(positional)]
    payload: String,
}

fn main() {
    env_logger::init();
    let cli: Cli = argh::from_env();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let outcome = match cli.command {
        Command::Decode(cmd) => load(&cmd.schema, cmd.binary)
            .map(|schema| decode(&schema, &cmd.payload, cmd.port)),
        Command::Encode(cmd) => {
            load(&cmd.schema, cmd.binary).map(|schema| encode(&schema, &cmd.record, cmd.port))
        }
        Command::Validate(cmd) => load(&cmd.schema, false).map(|schema| validate(&schema)),
        Command::Score(cmd) => load(&cmd.schema, cmd.binary)
            .map(|schema| score(&schema, &cmd.payload, cmd.port)),
    };
    match outcome {
        Err(schema_error) => {
            eprintln!("invalid schema: {schema_error:#}");
            2
        }
        Ok(Err(codec_error)) => {
            eprintln!("{codec_error:#}");
            1
        }
        Ok(Ok(())) => 0,
    }
}

fn load(path: &Path, binary: bool) -> Result<Schema> {
    if binary {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(load_schema_binary(&bytes)?)
    } else {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let def: SchemaDef = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(build_schema(def)?)
    }
}

fn metadata_for(port: Option<u32>) -> Option<Metadata> {
    port.map(|port| {
        let mut metadata = Metadata::new();
        metadata.insert("port".into(), Value::UInt(u64::from(port)));
        metadata
    })
}

fn parse_payload(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&cleaned).map_err(|_| anyhow!("payload is not hex: `{text}`"))
}

fn decode(schema: &Schema, payload: &str, port: Option<u32>) -> Result<()> {
    let payload = parse_payload(payload)?;
    let metadata = metadata_for(port);
    let result = schema
        .decode(&payload, metadata.as_ref())
        .map_err(|failure| anyhow!("{failure}"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn encode(schema: &Schema, record: &str, port: Option<u32>) -> Result<()> {
    let json: serde_json::Value =
        serde_json::from_str(record).context("parsing the record JSON")?;
    let serde_json::Value::Object(_) = &json else {
        return Err(anyhow!("the record must be a JSON object"));
    };
    let Value::Map(record) = json_to_value(json) else {
        unreachable!("objects convert to maps");
    };
    let bytes = match port {
        Some(port) => schema.encode_with_port(&record, port)?,
        None => schema.encode(&record)?,
    };
    println!("{}", hex::encode(bytes));
    Ok(())
}

fn validate(schema: &Schema) -> Result<()> {
    if schema.test_vectors.is_empty() {
        return Err(anyhow!("schema `{}` declares no test vectors", schema.name));
    }
    let mut failures = 0usize;
    for (index, vector) in schema.test_vectors.iter().enumerate() {
        let label = vector
            .description
            .clone()
            .unwrap_or_else(|| format!("vector {index}"));
        let metadata = metadata_for(vector.port);
        match schema.decode(&vector.payload, metadata.as_ref()) {
            Err(failure) => {
                failures += 1;
                println!("FAIL {label}: {failure}");
            }
            Ok(result) => {
                let mismatches: Vec<String> = vector
                    .expect
                    .iter()
                    .filter(|(key, expected)| result.record.get(*key) != Some(*expected))
                    .map(|(key, expected)| {
                        format!(
                            "{key}: expected {expected}, got {}",
                            result
                                .record
                                .get(key)
                                .map(ToString::to_string)
                                .unwrap_or_else(|| "nothing".into())
                        )
                    })
                    .collect();
                if mismatches.is_empty() {
                    println!("ok   {label}");
                } else {
                    failures += 1;
                    println!("FAIL {label}: {}", mismatches.join("; "));
                }
            }
        }
    }
    if failures > 0 {
        return Err(anyhow!(
            "{failures}/{} vector(s) failed",
            schema.test_vectors.len()
        ));
    }
    Ok(())
}

fn score(schema: &Schema, payload: &str, port: Option<u32>) -> Result<()> {
    let payload = parse_payload(payload)?;
    let metadata = metadata_for(port);
    let result = schema
        .decode(&payload, metadata.as_ref())
        .map_err(|failure| anyhow!("{failure}"))?;
    let total = result.quality.len();
    if total == 0 {
        println!("no fields declare a valid_range; nothing to score");
        return Ok(());
    }
    let good = result
        .quality
        .values()
        .filter(|q| **q == payload_schema::Quality::Good)
        .count();
    for (field, quality) in &result.quality {
        println!("{field}: {quality}");
    }
    println!("score: {good}/{total}");
    Ok(())
}

fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(v) => Value::Bool(v),
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Value::Int(v)
            } else if let Some(v) = n.as_u64() {
                Value::UInt(v)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(v) => Value::Str(v),
        serde_json::Value::Array(items) => {
            Value::List(items.into_iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => {
            let record: Record = map
                .into_iter()
                .map(|(k, v)| (k, json_to_value(v)))
                .collect();
            Value::Map(record)
        }
    }
}
