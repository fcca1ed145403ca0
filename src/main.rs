use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use trimatch::geom::Point;
use trimatch::matcher::{MatchConfig, MatchResult, PointSetMatcher, SolveStats};

#[derive(Parser)]
#[command(name = "trimatch", about = "Register two unordered 2D point sets")]
struct Cli {
    /// Log at debug level (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the similarity transform taking LIST1 onto LIST2.
    Match {
        /// Point file for the source list, one "x y" pair per line.
        list1: PathBuf,

        /// Point file for the target list.
        list2: PathBuf,

        /// Score against this file instead of LIST1.
        #[arg(long)]
        check1: Option<PathBuf>,

        /// Score against this file instead of LIST2.
        #[arg(long)]
        check2: Option<PathBuf>,

        /// TOML file of matcher parameters. Flags below override it.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Spanning-tree hops searched for list-1 triangles.
        #[arg(long)]
        step1: Option<usize>,

        /// Spanning-tree hops searched for list-2 triangles.
        #[arg(long)]
        step2: Option<usize>,

        /// Score at which the first transform is accepted.
        #[arg(long)]
        score_to_pass: Option<f64>,

        /// Best score below which the match is reported as failed.
        #[arg(long)]
        score_to_fail: Option<f64>,

        /// Scale and rotation tolerance of triangle fits.
        #[arg(long)]
        acceptable_ratio: Option<f64>,

        /// Match radius for scoring, in point units.
        #[arg(long)]
        check_accuracy: Option<f64>,

        /// Search time limit in seconds (no limit if omitted).
        #[arg(long)]
        timeout: Option<f64>,

        /// Re-fit the accepted transform over all matched points.
        #[arg(long)]
        refine: bool,
    },
    /// Print the default matcher parameters as TOML.
    DefaultConfig,
}

/// Parse a point file: one `x y` or `x,y` pair per line. Blank lines and
/// anything after `#` are ignored.
fn parse_points(text: &str) -> Result<Vec<Point>> {
    let mut points = Vec::new();
    for (n, raw) in text.lines().enumerate() {
        let line_no = n + 1;
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        let [x, y] = fields.as_slice() else {
            bail!("line {line_no}: expected two coordinates, found {}", fields.len());
        };
        let x: f64 = x
            .parse()
            .with_context(|| format!("line {line_no}: invalid x coordinate {x:?}"))?;
        let y: f64 = y
            .parse()
            .with_context(|| format!("line {line_no}: invalid y coordinate {y:?}"))?;
        let p = Point::new(x, y);
        if !p.is_finite() {
            bail!("line {line_no}: coordinates must be finite");
        }
        points.push(p);
    }
    Ok(points)
}

fn load_points(path: &Path) -> Result<Vec<Point>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_points(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<MatchConfig> {
    let Some(path) = path else {
        return Ok(MatchConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
}

fn print_solve_stats(stats: &SolveStats) {
    eprintln!(
        "Triangles: {} / {}, candidate pairs: {}, scored: {}",
        stats.triangles1, stats.triangles2, stats.candidate_pairs, stats.scored
    );
    eprintln!(
        "  Rejected: {} not similar, {} degenerate, {} scale out of range",
        stats.not_similar, stats.degenerate, stats.ratio_rejected
    );
    if stats.timed_out {
        eprintln!("  Search timed out");
    }
    if stats.cancelled {
        eprintln!("  Search cancelled");
    }
}

fn print_result(result: &MatchResult, stats: &SolveStats) {
    let (label, transform, score) = match result {
        MatchResult::Matched { transform, score } => ("Matched", transform, *score),
        MatchResult::Failed {
            best_transform,
            best_score,
        } => ("Failed", best_transform, *best_score),
    };
    println!("{label}");
    println!(
        "  Base position: ({:.4}, {:.4})",
        transform.base_position.x, transform.base_position.y
    );
    println!("  Ratio: {:.6}", transform.ratio);
    println!("  Angle: {:.4} deg", transform.angle);
    println!("  Score: {:.4} ({} points matched)", score, stats.matched_pairs.len());
    if stats.refined {
        println!("  Refined over matched points");
    }
}

/// Returns the process exit code: 0 matched, 2 failed.
fn cmd_match(
    list1: &Path,
    list2: &Path,
    check1: Option<&Path>,
    check2: Option<&Path>,
    config: MatchConfig,
) -> Result<i32> {
    let points1 = load_points(list1)?;
    let points2 = load_points(list2)?;
    info!("loaded {} and {} points", points1.len(), points2.len());

    let score_to_pass = config.score_to_pass;
    let mut matcher = PointSetMatcher::new(points1, points2, config)
        .context("invalid matcher parameters")?;
    if let Some(path) = check1 {
        matcher.set_checklist1(load_points(path)?);
    }
    if let Some(path) = check2 {
        matcher.set_checklist2(load_points(path)?);
    }

    let (result, stats) = matcher.solve();
    print_solve_stats(&stats);
    print_result(&result, &stats);
    if result.is_matched() && result.score() < score_to_pass {
        eprintln!("Weak match: score below {score_to_pass:.2}");
    }
    Ok(if result.is_matched() { 0 } else { 2 })
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Match {
            list1,
            list2,
            check1,
            check2,
            config,
            step1,
            step2,
            score_to_pass,
            score_to_fail,
            acceptable_ratio,
            check_accuracy,
            timeout,
            refine,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(v) = step1 {
                cfg.trigraph_search_step1 = v;
            }
            if let Some(v) = step2 {
                cfg.trigraph_search_step2 = v;
            }
            if let Some(v) = score_to_pass {
                cfg.score_to_pass = v;
            }
            if let Some(v) = score_to_fail {
                cfg.score_to_fail = v;
            }
            if let Some(v) = acceptable_ratio {
                cfg.acceptable_ratio = v;
            }
            if let Some(v) = check_accuracy {
                cfg.check_accuracy = v;
            }
            if timeout.is_some() {
                cfg.timeout_secs = timeout;
            }
            cfg.refine |= refine;
            cmd_match(&list1, &list2, check1.as_deref(), check2.as_deref(), cfg)
        }
        Commands::DefaultConfig => {
            let text = toml::to_string(&MatchConfig::default())
                .context("failed to serialize config")?;
            print!("{text}");
            Ok(0)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    };
    process::exit(code);
}
