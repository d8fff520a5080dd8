use std::io::Write;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use linebench::config::{self, RunConfig};
use linebench::{jagged, Engine, FencePolicy, TestId};

/// Cache-coherence latency microbenchmark: measures loads, stores, CAS, FAI,
/// TAS and SWAP against a shared cache line in controlled coherence states.
#[derive(Debug, Parser)]
#[command(name = "linebench", version, about, after_help = "Run with --list-tests for the numbered test catalogue.")]
struct Cli {
    /// Repetitions of the test case
    #[arg(short = 'r', long = "repetitions", default_value_t = config::DEFAULT_REPS)]
    repetitions: usize,

    /// Test id(s), as a jagged array: [12], [[12],[13]], or a per-thread row
    #[arg(short = 't', long = "test")]
    test: Option<String>,

    /// Physical core ids per group, e.g. [[0,1],[2,3]] or [0...3]
    #[arg(short = 'x', long = "cores_array")]
    cores_array: Option<String>,

    /// Thread count when --cores_array is absent
    #[arg(short = 'c', long = "cores", default_value_t = config::DEFAULT_CORES)]
    cores: usize,

    /// Core that primes the contended line each repetition
    #[arg(short = 'b', long = "seed")]
    seed: Option<usize>,

    /// Stride-hiding factor; rounded up to a power of two
    #[arg(short = 's', long = "stride", default_value_t = config::DEFAULT_STRIDE)]
    stride: u32,

    /// Fence level 0..=9 selecting the (load, store) fence pair
    #[arg(short = 'e', long = "fence", default_value_t = 0)]
    fence: u32,

    /// Region size, with optional K/M/G suffix
    #[arg(short = 'm', long = "mem-size")]
    mem_size: Option<String>,

    /// Flush the contended line before every repetition
    #[arg(short = 'f', long = "flush")]
    flush: bool,

    /// Precondition the word so atomic operations always succeed
    #[arg(short = 'u', long = "success")]
    success: bool,

    /// Exponential backoff in the retry-until-success loop
    #[arg(short = 'B', long = "backoff")]
    backoff: bool,

    /// Cap on backoff pause iterations
    #[arg(short = 'M', long = "backoff-max", default_value_t = config::DEFAULT_BACKOFF_MAX)]
    backoff_max: u32,

    /// Per-rank backoff caps; a single row of length T
    #[arg(short = 'A', long = "backoff-array")]
    backoff_array: Option<String>,

    /// Best-effort page lock of the shared region
    #[arg(short = 'K', long = "mlock")]
    mlock: bool,

    /// Disable NUMA-local first-touch placement
    #[arg(short = 'n', long = "no-numa")]
    no_numa: bool,

    /// Verbose result printing
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Under --verbose, how many raw samples to print per rank
    #[arg(short = 'p', long = "print")]
    print: Option<usize>,

    /// Print the numbered test catalogue and exit
    #[arg(long = "list-tests")]
    list_tests: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.list_tests {
        let mut out = std::io::stdout().lock();
        writeln!(out, "Supported tests:")?;
        for test in TestId::ALL {
            writeln!(out, "  {:2} - {}", test.raw(), test.name())?;
        }
        return Ok(());
    }

    let cfg = build_config(&cli)?;
    let report = Engine::run(cfg).context("benchmark run failed")?;
    report.render(&mut std::io::stdout().lock())?;
    Ok(())
}

fn build_config(cli: &Cli) -> anyhow::Result<RunConfig> {
    let available = num_cpus::get();
    if cli.cores_array.is_none() && cli.cores > available {
        tracing::warn!(
            requested = cli.cores,
            available,
            "more threads than hardware cores; expect scheduling noise"
        );
    }

    let tests = cli.test.as_deref().map(jagged::parse).transpose()?;
    let cores = cli.cores_array.as_deref().map(jagged::parse).transpose()?;
    let backoff_rows = cli
        .backoff_array
        .as_deref()
        .map(jagged::parse)
        .transpose()?;

    let mem_size = match &cli.mem_size {
        Some(s) => {
            let bytes = config::parse_size(s)?;
            println!("Data size : {} KiB", bytes / 1024);
            bytes
        }
        None => config::DEFAULT_CACHE_LINES * config::CACHE_LINE_BYTES,
    };

    // Without a core array the rank mapper synthesizes one group running the
    // default test, so a lone `-t [N]` selects N for everybody.
    let default_test = tests
        .as_ref()
        .map(|rows| rows[0][0])
        .unwrap_or(TestId::StoreOnModified.raw());

    Ok(RunConfig {
        reps: cli.repetitions,
        tests,
        cores,
        backoff_rows,
        default_cores: cli.cores,
        default_test,
        seed_core: cli.seed,
        stride: config::pow2_roundup(cli.stride),
        fence: FencePolicy::from_level(cli.fence)?,
        mem_size,
        flush: cli.flush,
        ao_success: cli.success,
        backoff: cli.backoff,
        backoff_max: cli.backoff_max.max(1),
        lock_pages: cli.mlock,
        numa: !cli.no_numa,
        verbose: cli.verbose || cli.print.is_some(),
        print: cli.print.unwrap_or(0),
    })
}
