//! Command-line front end.
//!
//! ```text
//! grammar-miner mine traces/ -o grammar.json
//! grammar-miner refine grammar.json --program ./subject -o refined.json
//! grammar-miner generate refined.json -n 20
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use log::info;
use serde::{Deserialize, Serialize};

use grammar_miner::config::{self, MinerConfig, RefinementConfig};
use grammar_miner::deadline::Deadline;
use grammar_miner::dot::{exec_tree_to_dot, parse_tree_to_dot, DotConfig};
use grammar_miner::generator::sample_strings;
use grammar_miner::grammar::Grammar;
use grammar_miner::miner::Miner;
use grammar_miner::oracle::{CachedOracle, ProgramOracle};
use grammar_miner::parser::{EarleyParser, ParseOutcome};
use grammar_miner::refine::{precision, Refiner};
use grammar_miner::token_miner::mine_tokens;
use grammar_miner::trace::trace_files;
use grammar_miner::tree::TreeArena;

#[derive(Parser)]
#[command(name = "grammar-miner", version)]
#[command(about = "Mine and refine input grammars from parser execution traces")]
struct Cli {
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// JSON file with "miner" and/or "refinement" settings
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mine a grammar from a directory of trace files
    Mine {
        /// Directory with one JSON trace per input
        traces: PathBuf,
        /// Output grammar file
        #[arg(short, long)]
        output: PathBuf,
        /// Token grammar for token-cursor subjects
        #[arg(long, value_name = "FILE")]
        tokens: Option<PathBuf>,
        /// Write the execution tree of every trace as DOT into this directory
        #[arg(long, value_name = "DIR")]
        dot: Option<PathBuf>,
        /// Write intermediate grammars into this directory
        #[arg(long, value_name = "DIR")]
        snapshots: Option<PathBuf>,
    },
    /// Mine a token grammar from per-token lexer traces
    MineTokens {
        /// Directories with token traces
        #[arg(required = true)]
        traces: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Remove overapproximation from a grammar using the subject as oracle
    Refine {
        grammar: PathBuf,
        #[command(flatten)]
        subject: SubjectArgs,
        /// Directory of inputs known to be valid (e.g. the mining seeds)
        #[arg(long, value_name = "DIR")]
        inputs: Option<PathBuf>,
        /// Write refinement snapshots into this directory
        #[arg(long, value_name = "DIR")]
        snapshots: Option<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print inputs generated from a grammar
    Generate {
        grammar: PathBuf,
        /// Number of inputs
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
        /// Depth after which the cheapest alternatives are taken
        #[arg(short, long, default_value = "10")]
        depth: usize,
        #[arg(long, default_value = "0")]
        seed: u64,
    },
    /// Measure the precision of a grammar against the subject
    Precision {
        grammar: PathBuf,
        #[command(flatten)]
        subject: SubjectArgs,
    },
    /// Parse an input file with a grammar
    Parse {
        grammar: PathBuf,
        input: PathBuf,
        /// Write the parse tree as DOT
        #[arg(long, value_name = "FILE")]
        dot: Option<PathBuf>,
    },
    /// Check a grammar for well-formedness and print it
    Check { grammar: PathBuf },
}

#[derive(Args)]
struct SubjectArgs {
    /// Program that reads an input on stdin and exits with 0 iff it is valid
    #[arg(long)]
    program: PathBuf,
    /// Extra arguments passed to the program
    #[arg(long = "arg", value_name = "ARG")]
    args: Vec<String>,
    /// Per-run timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: f64,
}

impl SubjectArgs {
    fn oracle(&self) -> color_eyre::Result<CachedOracle<ProgramOracle>> {
        let timeout = Duration::try_from_secs_f64(self.timeout).wrap_err("invalid --timeout")?;
        let program = ProgramOracle::new(&self.program, timeout)?.with_args(self.args.iter().cloned());
        Ok(CachedOracle::new(program))
    }
}

/// Contents of the `--config` file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Settings {
    miner: MinerConfig,
    refinement: RefinementConfig,
}

/// Reads a file as Latin-1, one character per byte.
fn read_latin1(path: &Path) -> color_eyre::Result<String> {
    let bytes = fs::read(path).wrap_err_with(|| format!("cannot read {}", path.display()))?;
    Ok(bytes.into_iter().map(char::from).collect())
}

fn load_grammar(path: &Path) -> color_eyre::Result<Grammar> {
    Grammar::load(path).wrap_err_with(|| format!("cannot load grammar {}", path.display()))
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => simplelog::LevelFilter::Warn,
        (false, 0) => simplelog::LevelFilter::Info,
        (false, 1) => simplelog::LevelFilter::Debug,
        (false, _) => simplelog::LevelFilter::Trace,
    };
    simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let settings: Settings = match &cli.config {
        Some(path) => config::load(path).wrap_err_with(|| format!("cannot load config {}", path.display()))?,
        None => Settings::default(),
    };

    match cli.command {
        Command::Mine {
            traces,
            output,
            tokens,
            dot,
            snapshots,
        } => {
            let mut miner_config = settings.miner;
            if snapshots.is_some() {
                miner_config.snapshot_dir = snapshots;
            }
            let token_grammar = tokens.as_deref().map(load_grammar).transpose()?;
            let mut miner = Miner::new(miner_config);
            if let Some(tokens) = &token_grammar {
                miner = miner.with_token_grammar(tokens);
            }
            if let Some(dir) = &dot {
                fs::create_dir_all(dir)?;
            }
            for file in trace_files(&traces)? {
                let tree = miner
                    .add_file(&file)
                    .wrap_err_with(|| format!("cannot mine {}", file.display()))?;
                if let (Some(dir), Some(tree)) = (&dot, tree) {
                    let name = file.file_stem().unwrap_or(file.as_os_str());
                    let out = dir.join(name).with_extension("dot");
                    fs::write(&out, exec_tree_to_dot(&tree, &DotConfig::default())?)?;
                }
            }
            let grammar = miner.finish()?;
            grammar.save(&output)?;
            info!("wrote {}", output.display());
        }

        Command::MineTokens { traces, output } => {
            let grammar = mine_tokens(&traces, &settings.miner)?;
            grammar.save(&output)?;
            info!("wrote {}", output.display());
        }

        Command::Refine {
            grammar,
            subject,
            inputs,
            snapshots,
            output,
        } => {
            let grammar = load_grammar(&grammar)?;
            let oracle = subject.oracle()?;
            let mut refinement = settings.refinement;
            if snapshots.is_some() {
                refinement.snapshot_dir = snapshots;
            }
            let mut refiner = Refiner::new(&oracle, refinement);
            if let Some(dir) = inputs {
                let mut valid = Vec::new();
                for entry in fs::read_dir(&dir)? {
                    let path = entry?.path();
                    if path.is_file() {
                        valid.push(read_latin1(&path)?);
                    }
                }
                info!("{} known valid inputs", valid.len());
                refiner.add_valid_inputs(valid);
            }
            let report = refiner.refine(grammar)?;
            println!(
                "{} after {} refinements in {:.1?}",
                report.termination, report.refinements, report.elapsed
            );
            if let Some(p) = report.precision_history.last() {
                println!("last measured precision: {:.3}", p);
            }
            report.grammar.save(&output)?;
            info!("wrote {}", output.display());
        }

        Command::Generate {
            grammar,
            count,
            depth,
            seed,
        } => {
            let grammar = load_grammar(&grammar)?;
            grammar.validate()?;
            let timeout = settings.refinement.generation_timeout;
            for input in sample_strings(&grammar, count, depth, seed, timeout)? {
                println!("{:?}", input);
            }
        }

        Command::Precision { grammar, subject } => {
            let grammar = load_grammar(&grammar)?;
            let oracle = subject.oracle()?;
            match precision(&grammar, &oracle, &settings.refinement)? {
                Some(p) => println!("{:.4}", p),
                None => bail!("no generated input could be classified"),
            }
        }

        Command::Parse { grammar, input, dot } => {
            let grammar = load_grammar(&grammar)?;
            let text = read_latin1(&input)?;
            let parser = EarleyParser::new(&grammar);
            let mut arena = TreeArena::new();
            let deadline = Deadline::after(settings.refinement.parse_timeout);
            match parser.parse(&mut arena, &text, &deadline) {
                ParseOutcome::Tree(root) => {
                    println!("{}", arena.outline(root));
                    if let Some(path) = dot {
                        fs::write(&path, parse_tree_to_dot(&arena, root, &DotConfig::default())?)?;
                    }
                }
                ParseOutcome::NoParse => bail!("input is not in the language of the grammar"),
                ParseOutcome::Timeout => bail!("parsing timed out"),
            }
        }

        Command::Check { grammar } => {
            let grammar = load_grammar(&grammar)?;
            print!("{}", grammar);
            grammar.validate()?;
            println!("ok: {} nonterminals", grammar.len());
        }
    }

    Ok(())
}
