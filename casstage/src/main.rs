mod output;

use anyhow::{Context, Result};
use casstage_core::{
    ActionResult, Config, Digest, DigestGenerator, HashFunction, LocalBroker, LocalCas, MergeOutcome,
    Materializer, OutputSpec, StagedDirectory, Stager, StagingStrategy, Uploader,
    create_merged_digest, load_arena, upload_new_digests,
};
use clap::{Parser, Subcommand};
use output::{DigestOutput, InitOutput, MergeOutput, OutputWriter, RunOutput, StageOutput};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use tracing_subscriber::EnvFilter;

/// casstage - stage content-addressed trees and capture outputs
#[derive(Parser)]
#[command(name = "casstage")]
#[command(about = "Stage CAS trees to disk, capture outputs, merge Merkle trees", long_about = None)]
#[command(version)]
struct Cli {
    /// Store root directory (overrides CASSTAGE_ROOT and the config file)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging on stderr. Repeat for more (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store
    Init {
        /// Digest function of the store
        #[arg(long)]
        hash: Option<String>,
    },

    /// Print the digest of a local file
    Digest {
        file: PathBuf,

        /// Digest function to use
        #[arg(long)]
        hash: Option<String>,
    },

    /// Capture a local file or directory into the store
    Add { path: PathBuf },

    /// Merge two stored trees and store the result
    Merge {
        /// Root digest of the input tree (<hash>/<size>)
        input: String,

        /// Root digest of the template tree (<hash>/<size>)
        template: String,
    },

    /// Materialize a stored tree at a destination that must not exist
    Stage { digest: String, dest: PathBuf },

    /// Stage a tree, run a command inside it, and capture its outputs
    Run {
        /// Root digest of the input tree
        digest: String,

        /// Output file to capture, relative to the working directory
        #[arg(long = "output-file")]
        output_files: Vec<PathBuf>,

        /// Output directory to capture, relative to the working directory
        #[arg(long = "output-dir")]
        output_dirs: Vec<PathBuf>,

        /// Working directory of the command, relative to the staged root
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Staging strategy (fallback or broker)
        #[arg(long)]
        strategy: Option<String>,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let out = OutputWriter::new(cli.json);
    let result = load_config(&cli).and_then(|config| dispatch(cli.command, &config, &out));

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            out.write_error(&e, 2);
            ExitCode::from(2)
        }
    }
}

/// Config precedence: CLI flag > environment > file > default.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    config
        .apply_env()
        .context("Invalid configuration in environment")?;
    if let Some(root) = &cli.root {
        config.store.root = root.clone();
    }
    tracing::debug!(?config, "resolved configuration");
    Ok(config)
}

fn dispatch(command: Commands, config: &Config, out: &OutputWriter) -> Result<u8> {
    match command {
        Commands::Init { hash } => cmd_init(config, hash.as_deref(), out),
        Commands::Digest { file, hash } => cmd_digest(config, &file, hash.as_deref(), out),
        Commands::Add { path } => cmd_add(config, &path, out),
        Commands::Merge { input, template } => cmd_merge(config, &input, &template, out),
        Commands::Stage { digest, dest } => cmd_stage(config, &digest, &dest, out),
        Commands::Run {
            digest,
            output_files,
            output_dirs,
            workdir,
            strategy,
            command,
        } => {
            let spec = OutputSpec {
                working_directory: workdir.unwrap_or_default(),
                output_files,
                output_directories: output_dirs,
                output_node_properties: Vec::new(),
            };
            cmd_run(config, &digest, spec, strategy.as_deref(), &command, out)
        }
    }
}

fn hash_function(config: &Config, name: Option<&str>) -> Result<HashFunction> {
    match name {
        Some(name) => Ok(HashFunction::parse(name)?),
        None => Ok(config.digest.function),
    }
}

fn open_store(config: &Config) -> Result<LocalCas> {
    let root = &config.store.root;
    LocalCas::open(root).with_context(|| format!("Failed to open store at {}", root.display()))
}

fn parse_digest(s: &str) -> Result<Digest> {
    Digest::parse(s).with_context(|| format!("Invalid digest: {s}"))
}

fn cmd_init(config: &Config, hash: Option<&str>, out: &OutputWriter) -> Result<u8> {
    let function = hash_function(config, hash)?;
    let root = &config.store.root;

    LocalCas::init(root, function)
        .with_context(|| format!("Failed to initialize store at {}", root.display()))?;

    let data = InitOutput {
        success: true,
        result_code: 0,
        root: root.display().to_string(),
        hash_function: function.to_string(),
    };
    out.write(&data, || {
        format!(
            "Initialized casstage store at {}\nHash function: {function}\n",
            root.display()
        )
    })?;
    Ok(0)
}

fn cmd_digest(config: &Config, file: &Path, hash: Option<&str>, out: &OutputWriter) -> Result<u8> {
    let generator = DigestGenerator::new(hash_function(config, hash)?);
    let digest = generator
        .hash_path(file)
        .with_context(|| format!("Failed to hash {}", file.display()))?;

    let text = format!("{digest}\n");
    let data = DigestOutput {
        success: true,
        result_code: 0,
        digest,
        path: file.display().to_string(),
        kind: None,
    };
    out.write(&data, || text)?;
    Ok(0)
}

fn cmd_add(config: &Config, path: &Path, out: &OutputWriter) -> Result<u8> {
    let cas = open_store(config)?;
    let policy = config.retry_policy();
    let uploader = Uploader::new(&cas, cas.generator(), &policy);

    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let (digest, kind) = if metadata.is_dir() {
        let digest = uploader
            .upload_directory(path, &[])
            .with_context(|| format!("Failed to add directory {}", path.display()))?;
        (digest, "directory")
    } else {
        let (digest, _) = uploader
            .upload_file(path)
            .with_context(|| format!("Failed to add file {}", path.display()))?;
        (digest, "file")
    };

    let text = format!("{digest} {}\n", path.display());
    let data = DigestOutput {
        success: true,
        result_code: 0,
        digest,
        path: path.display().to_string(),
        kind: Some(kind),
    };
    out.write(&data, || text)?;
    Ok(0)
}

fn cmd_merge(config: &Config, input: &str, template: &str, out: &OutputWriter) -> Result<u8> {
    let cas = open_store(config)?;
    let policy = config.retry_policy();
    let input = parse_digest(input)?;
    let template = parse_digest(template)?;

    let arena = load_arena(&cas, &policy, [&input, &template])
        .context("Failed to load directory records")?;
    let outcome = create_merged_digest(&cas.generator(), &arena, Some(&input), Some(&template), true)?;

    let data = match outcome {
        MergeOutcome::Merged(tree) => {
            let uploaded = match &tree.new_digests {
                Some(new) => upload_new_digests(&cas, &policy, new)
                    .context("Failed to store merged directory records")?,
                None => 0,
            };
            MergeOutput {
                success: true,
                result_code: 0,
                root: Some(tree.root),
                uploaded,
                collision: None,
            }
        }
        MergeOutcome::Collided(collision) => MergeOutput {
            success: false,
            result_code: 1,
            root: None,
            uploaded: 0,
            collision: Some(collision),
        },
    };

    let code = data.result_code;
    out.write(&data, || match (&data.root, &data.collision) {
        (Some(root), _) => format!("{root}\n"),
        (None, Some(collision)) => format!("Collision at {collision}\n"),
        (None, None) => String::new(),
    })?;
    Ok(code)
}

fn cmd_stage(config: &Config, digest: &str, dest: &Path, out: &OutputWriter) -> Result<u8> {
    let cas = open_store(config)?;
    let policy = config.retry_policy();
    let digest = parse_digest(digest)?;

    if dest.exists() {
        anyhow::bail!("Destination already exists: {}", dest.display());
    }

    let stats = Materializer::new(&cas, &policy)
        .materialize(&digest, dest)
        .with_context(|| format!("Failed to stage {digest} to {}", dest.display()))?;

    let text = format!("Staged {digest} to {}\n", dest.display());
    let data = StageOutput {
        success: true,
        result_code: 0,
        digest,
        destination: dest.display().to_string(),
        files: stats.files,
        directories: stats.directories,
    };
    out.write(&data, || text)?;
    Ok(0)
}

fn cmd_run(
    config: &Config,
    digest: &str,
    spec: OutputSpec,
    strategy: Option<&str>,
    command: &[String],
    out: &OutputWriter,
) -> Result<u8> {
    let cas = open_store(config)?;
    let digest = parse_digest(digest)?;
    let strategy = match strategy {
        Some(name) => name.parse::<StagingStrategy>()?,
        None => config.staging.strategy,
    };

    let broker = LocalBroker::new(open_store(config)?, config.staging.root.join("broker"));
    let stager = Stager::new(&cas, &config.staging.root)
        .with_strategy(strategy)
        .with_broker(&broker)
        .with_generator(cas.generator())
        .with_policy(config.retry_policy());

    let staged = stager
        .stage(&digest)
        .with_context(|| format!("Failed to stage {digest}"))?;
    let result = run_in(&*staged, &spec, command)?;

    let code = if result.exit_code == 0 { 0 } else { 1 };
    let text = format_action_result(&result);
    let data = RunOutput {
        success: code == 0,
        result_code: code,
        strategy: strategy.to_string(),
        action_result: result,
    };
    out.write(&data, || text)?;
    Ok(code)
}

/// Run `command` inside the staged tree and capture the declared outputs.
fn run_in(staged: &dyn StagedDirectory, spec: &OutputSpec, command: &[String]) -> Result<ActionResult> {
    let (program, args) = command
        .split_first()
        .context("No command given")?;
    let cwd = staged.path().join(&spec.working_directory);
    std::fs::create_dir_all(&cwd)
        .with_context(|| format!("Failed to create working directory {}", cwd.display()))?;

    tracing::info!(program, cwd = %cwd.display(), "running command");
    let status = Command::new(program)
        .args(args)
        .current_dir(&cwd)
        .status()
        .with_context(|| format!("Failed to run {program}"))?;

    let mut result = ActionResult {
        exit_code: status.code().unwrap_or(-1),
        ..ActionResult::default()
    };
    staged
        .capture_all_outputs(spec, &mut result)
        .context("Failed to capture outputs")?;
    Ok(result)
}

fn format_action_result(result: &ActionResult) -> String {
    let mut text = format!("exit code: {}\n", result.exit_code);
    for file in &result.output_files {
        text.push_str(&format!("file {} {}\n", file.digest, file.path.display()));
    }
    for dir in &result.output_directories {
        text.push_str(&format!("dir  {} {}\n", dir.tree_digest, dir.path.display()));
    }
    text
}
