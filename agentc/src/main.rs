//! Agent plugin compiler.
//!
//! Validates declarative plugin specs, generates and builds loadable plugin
//! artifacts, and runs them inside an isolation boundary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use agentc::build::{BuildOptions, build};
use agentc::core::cancel::CancelToken;
use agentc::core::platform::TargetPlatform;
use agentc::generate::{GenerateOptions, generate_with};
use agentc::io::config::{AgentcConfig, CONFIG_FILE, load_config, write_config};
use agentc::io::process::{OutputLine, OutputStream};
use agentc::io::registry::Registry;
use agentc::io::spec_store::load_spec;
use agentc::io::templates::{TemplateSet, export_builtin};
use agentc::plugin::{LoadedPlugin, PluginRuntime};
use agentc::{exit_codes, logging};
use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "agentc",
    version,
    about = "Compile declarative agent specs into isolated native plugins"
)]
struct Cli {
    /// Config file (defaults apply when it does not exist).
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `agentc.toml`.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Copy the built-in code templates into a directory for customization.
    Templates { dir: PathBuf },
    /// Check a spec against the schema and invariants.
    Validate { spec: PathBuf },
    /// Render the source tree for a spec and print its directory.
    Generate {
        spec: PathBuf,
        /// Parent directory of the generated tree.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Template directory overriding the configured one.
        #[arg(long)]
        templates: Option<PathBuf>,
    },
    /// Generate and build a spec into a loadable artifact.
    Build {
        spec: PathBuf,
        /// Target as `os/arch`; defaults to the host.
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        templates: Option<PathBuf>,
        /// Keep the generated tree after building.
        #[arg(long)]
        keep_build_dir: bool,
    },
    /// Load an artifact, start its agent, and send one input.
    Run {
        artifact: PathBuf,
        #[arg(long)]
        input: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// List agents recorded in the registry.
    Agents,
}

enum Failure {
    Agent(agentc::Error),
    Other(anyhow::Error),
}

impl From<agentc::Error> for Failure {
    fn from(err: agentc::Error) -> Self {
        Failure::Agent(err)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Failure::Other(err)
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(Failure::Agent(err)) => {
            eprintln!("[{}] {:#}", err.stage(), err);
            exit_codes::for_error(&err)
        }
        Err(Failure::Other(err)) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32, Failure> {
    if let Command::Init { force } = cli.command {
        return cmd_init(&cli.config, force);
    }
    let cfg = load_config(&cli.config)?;
    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Templates { dir } => cmd_templates(&dir),
        Command::Validate { spec } => cmd_validate(&spec),
        Command::Generate {
            spec,
            out,
            templates,
        } => cmd_generate(&cfg, &spec, out, templates),
        Command::Build {
            spec,
            target,
            out,
            templates,
            keep_build_dir,
        } => cmd_build(&cfg, &spec, target, out, templates, keep_build_dir),
        Command::Run {
            artifact,
            input,
            session,
        } => cmd_run(&cfg, &artifact, &input, session.as_deref()),
        Command::Agents => cmd_agents(&cfg),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32, Failure> {
    if path.exists() && !force {
        return Err(anyhow!("{} already exists (use --force to overwrite)", path.display()).into());
    }
    write_config(path, &AgentcConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_templates(dir: &Path) -> Result<i32, Failure> {
    for path in export_builtin(dir)? {
        println!("{}", path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_validate(path: &Path) -> Result<i32, Failure> {
    let file = load_spec(path)?;
    println!("{} {} is valid", file.spec.id, file.spec.version);
    Ok(exit_codes::OK)
}

fn template_set(cfg: &AgentcConfig, flag: Option<PathBuf>) -> TemplateSet {
    match flag {
        Some(dir) => TemplateSet::from_dir(dir),
        None => TemplateSet::from_config(cfg.paths.template_dir.as_deref()),
    }
}

fn generate_options(cfg: &AgentcConfig, out_dir: PathBuf, base_dir: PathBuf) -> GenerateOptions {
    let mut opts = GenerateOptions::new(out_dir, base_dir);
    opts.go_version = cfg.toolchain.go_version.clone();
    opts
}

fn cmd_generate(
    cfg: &AgentcConfig,
    spec_path: &Path,
    out: Option<PathBuf>,
    templates: Option<PathBuf>,
) -> Result<i32, Failure> {
    let file = load_spec(spec_path)?;
    let out_dir = out.unwrap_or_else(|| cfg.paths.output_dir.join("src"));
    let opts = generate_options(cfg, out_dir, file.base_dir);
    let tree = generate_with(&file.spec, &template_set(cfg, templates), &opts)?;
    println!("{}", tree.root.display());
    Ok(exit_codes::OK)
}

fn cmd_build(
    cfg: &AgentcConfig,
    spec_path: &Path,
    target: Option<String>,
    out: Option<PathBuf>,
    templates: Option<PathBuf>,
    keep_build_dir: bool,
) -> Result<i32, Failure> {
    let platform = match target {
        Some(target) => target.parse::<TargetPlatform>(),
        None => TargetPlatform::host(),
    }
    .map_err(|e| anyhow!(e))?;
    let file = load_spec(spec_path)?;
    let out_dir = out.unwrap_or_else(|| cfg.paths.output_dir.clone());
    let opts = generate_options(cfg, out_dir.join("src"), file.base_dir);
    let tree = generate_with(&file.spec, &template_set(cfg, templates), &opts)?;

    let mut options = BuildOptions::from_config(&cfg.toolchain, out_dir);
    options.keep_build_dir |= keep_build_dir;
    let (tx, rx) = mpsc::channel::<OutputLine>();
    options.progress = Some(tx);
    let printer = thread::spawn(move || {
        for line in rx {
            match line.stream {
                OutputStream::Stdout => eprintln!("  | {}", line.line),
                OutputStream::Stderr => eprintln!("  ! {}", line.line),
            }
        }
    });
    let result = build(&tree, &platform, &options, &CancelToken::new());
    drop(options);
    if printer.join().is_err() {
        eprintln!("progress printer panicked");
    }
    let result = result?;

    if result.build_dir_retained {
        eprintln!("build dir kept at {}", result.build_dir.display());
    }
    let elapsed = result.elapsed;
    let artifact = result.into_artifact()?;
    println!("{}", artifact.display());
    eprintln!("built for {platform} in {:.1}s", elapsed.as_secs_f64());
    Ok(exit_codes::OK)
}

fn cmd_run(
    cfg: &AgentcConfig,
    artifact: &Path,
    input: &str,
    session: Option<&str>,
) -> Result<i32, Failure> {
    let plugin = LoadedPlugin::load(artifact)?;
    let registry = Arc::new(Registry::open(&cfg.paths.registry_dir)?);
    let cancel = CancelToken::new();
    let mut runtime = PluginRuntime::new(cfg.interpreter.clone(), cfg.tee.clone());
    runtime.initialize(plugin, Some(registry))?;
    runtime.start(&cancel)?;
    let outcome = runtime.run_agent(input, session, &cancel);
    runtime.stop()?;
    let response = outcome?;
    let json = serde_json::to_string_pretty(&response).context("serialize response")?;
    println!("{json}");
    Ok(exit_codes::OK)
}

fn cmd_agents(cfg: &AgentcConfig) -> Result<i32, Failure> {
    let registry = Registry::open(&cfg.paths.registry_dir)?;
    for agent in registry.list_agents()? {
        println!(
            "{}\t{} {}\t{}\t{}",
            agent.agent_id,
            agent.plugin_id,
            agent.plugin_version,
            agent.kind.as_str(),
            agent.isolation
        );
    }
    Ok(exit_codes::OK)
}
