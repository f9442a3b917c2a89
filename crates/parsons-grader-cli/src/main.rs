use clap::Parser;
use parsons_grader::{
    CodeBlocks, FileStore, Grader, GraderSettings, ProblemSession, Task,
};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Grade a Parsons-problem submission and emit the result as JSON.
#[derive(Parser, Debug)]
#[command(name = "parsons-grader-cli", about = "Grade a Parsons-problem submission and emit JSON result")]
struct Args {
    /// Read the submission from file instead of stdin
    #[arg(long)]
    file: Option<PathBuf>,

    /// Function header (def line plus doctest docstring)
    #[arg(long, conflicts_with = "task", required_unless_present = "task")]
    header: Option<PathBuf>,

    /// Task JSON carrying `code_blocks`
    #[arg(long)]
    task: Option<PathBuf>,

    /// Print the task's starter lines instead of grading
    #[arg(long, requires = "task")]
    starter: bool,

    /// GraderSettings JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Wall-clock limit for one run, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Comma-separated list of allowed modules
    #[arg(long)]
    modules: Option<String>,

    /// Arrangement store file; saves the submission under `<problem-id>-repr`
    #[arg(long, requires_all = ["task", "problem_id"])]
    store: Option<PathBuf>,

    /// Problem id used as the arrangement key prefix
    #[arg(long)]
    problem_id: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let task: Option<CodeBlocks> = args.task.as_deref().map(|path| {
        let task: Task = serde_json::from_str(&read_or_exit(path)).unwrap_or_else(|e| {
            eprintln!("Error parsing task {}: {e}", path.display());
            std::process::exit(1);
        });
        task.code_blocks
    });

    if args.starter {
        if let Some(blocks) = &task {
            println!("{}", blocks.starter_lines());
        }
        return;
    }

    let code = if let Some(path) = &args.file {
        read_or_exit(path)
    } else {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).unwrap_or_else(|e| {
            eprintln!("Error reading stdin: {e}");
            std::process::exit(1);
        });
        buf
    };
    // Editors leave a trailing newline the widget never produces.
    let code = code.strip_suffix('\n').unwrap_or(&code);

    let mut settings = match &args.config {
        Some(path) => serde_json::from_str(&read_or_exit(path)).unwrap_or_else(|e| {
            eprintln!("Error parsing config {}: {e}", path.display());
            std::process::exit(1);
        }),
        None => GraderSettings::default(),
    };
    if let Some(timeout_ms) = args.timeout_ms {
        settings.timeout_ms = timeout_ms;
    }
    if let Some(m) = args.modules {
        settings.allowed_modules = m.split(',').map(|s| s.trim().to_string()).collect();
    }

    let grader = Grader::new(&settings);
    let result = match (task, args.store, args.problem_id) {
        (Some(blocks), Some(store), Some(problem_id)) => {
            ProblemSession::new(problem_id, blocks, FileStore::new(store)).submit(&grader, code, code)
        }
        (Some(blocks), _, _) => grader.grade(code, &blocks.function_header),
        (None, _, _) => {
            let header = args.header.as_deref().map(read_or_exit).unwrap_or_default();
            grader.grade(code, &header)
        }
    };

    // Exit 0 always; the verdict is in the JSON.
    let json = serde_json::to_string(&result).expect("GradingResult is always serializable");
    println!("{json}");
}

fn read_or_exit(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {e}", path.display());
        std::process::exit(1);
    })
}
