use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "Reconcile, match and clean tabular datasets", long_about = None)]
pub struct Cli {
    /// Engine configuration file (YAML); defaults apply when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute a transformation payload against one or more datasets
    Run(RunArgs),
    /// Map keys of one column onto the keys of another
    Resolve(ResolveArgs),
    /// Classify two ledgers row by row as matched, within tolerance or unmatched
    Reconcile(ReconcileArgs),
    /// Drive full turns from a scripted decision and payload file
    Replay(ReplayArgs),
    /// Write the default engine configuration to a YAML file
    Config(ConfigArgs),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Args)]
pub struct InputArgs {
    /// Dataset to load, as `name=path` or just `path` (named after the file stem)
    #[arg(short = 'i', long = "input", value_parser = parse_input_spec, action = clap::ArgAction::Append, required = true)]
    pub inputs: Vec<InputSpec>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input files (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Alias table (YAML) used to judge semantic key matches
    #[arg(long)]
    pub aliases: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct OutputArgs {
    /// Write the designated result table to this CSV file
    #[arg(long)]
    pub result: Option<PathBuf>,
    /// Write the audit ledger to this CSV file
    #[arg(long)]
    pub audit: Option<PathBuf>,
    /// Write chart descriptions to this JSON file
    #[arg(long)]
    pub charts: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub input: InputArgs,
    /// File containing the payload to execute
    #[arg(short, long)]
    pub payload: PathBuf,
    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// CSV file holding the keys to resolve
    #[arg(long)]
    pub source: PathBuf,
    /// Key column in the source file
    #[arg(long = "source-column")]
    pub source_column: String,
    /// CSV file holding the candidate keys
    #[arg(long)]
    pub target: PathBuf,
    /// Key column in the target file
    #[arg(long = "target-column")]
    pub target_column: String,
    /// Alias table (YAML) used to judge semantic matches
    #[arg(long)]
    pub aliases: Option<PathBuf>,
    /// Write the key mapping to this CSV file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Write the source left-joined with the target on resolved keys
    #[arg(long)]
    pub merge: Option<PathBuf>,
    /// Write the audit ledger to this CSV file
    #[arg(long)]
    pub audit: Option<PathBuf>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input files (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    /// Left ledger CSV file
    #[arg(long)]
    pub left: PathBuf,
    #[arg(long = "left-key")]
    pub left_key: String,
    #[arg(long = "left-amount")]
    pub left_amount: String,
    /// Right ledger CSV file
    #[arg(long)]
    pub right: PathBuf,
    #[arg(long = "right-key")]
    pub right_key: String,
    #[arg(long = "right-amount")]
    pub right_amount: String,
    /// Absolute difference still counted as a match (defaults to the configured tolerance)
    #[arg(long)]
    pub tolerance: Option<f64>,
    /// Write every reconciliation record to this CSV file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Write the audit ledger to this CSV file
    #[arg(long)]
    pub audit: Option<PathBuf>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input files (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub input: InputArgs,
    /// YAML file with `decisions` and `payloads` lists
    #[arg(short, long)]
    pub script: PathBuf,
    /// Instruction for one turn; repeat for several turns (none runs an overview turn)
    #[arg(long = "instruction", action = clap::ArgAction::Append)]
    pub instructions: Vec<String>,
    #[command(flatten)]
    pub output: OutputArgs,
    /// Write the turn reports to this JSON file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Destination YAML file
    #[arg(short, long)]
    pub output: PathBuf,
}

pub fn parse_input_spec(value: &str) -> Result<InputSpec, String> {
    let (name, path) = match value.split_once('=') {
        Some((name, path)) => (name.trim().to_string(), PathBuf::from(path.trim())),
        None => {
            let path = PathBuf::from(value.trim());
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
                .ok_or_else(|| format!("Cannot derive a dataset name from '{value}'"))?;
            (stem, path)
        }
    };
    if name.is_empty() {
        return Err(format!("Dataset name missing in '{value}'"));
    }
    if path.as_os_str().is_empty() {
        return Err(format!("Path missing in '{value}'"));
    }
    Ok(InputSpec { name, path })
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_spec_accepts_named_and_bare_paths() {
        assert_eq!(
            parse_input_spec("orders=data/orders.csv").unwrap(),
            InputSpec {
                name: "orders".into(),
                path: PathBuf::from("data/orders.csv"),
            }
        );
        assert_eq!(parse_input_spec("data/bank.tsv").unwrap().name, "bank");
        assert!(parse_input_spec("=x.csv").is_err());
        assert!(parse_input_spec("name=").is_err());
    }

    #[test]
    fn delimiter_aliases() {
        assert_eq!(parse_delimiter("tab").unwrap(), b'\t');
        assert_eq!(parse_delimiter(";").unwrap(), b';');
        assert!(parse_delimiter("ab").is_err());
    }
}
