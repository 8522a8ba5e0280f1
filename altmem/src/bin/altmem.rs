use altmem::*;
use altmem::algo::{
    comparator::BaseOrder,
    slicing::SliceOptions,
    Options, PickerConfig,
};
use tracing_subscriber::EnvFilter;

/// Splits a straight-line program between alternate and default memory
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to input (minimalloc CSV, optional fifth column of use times).
    /// Rows are renumbered densely in file order
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    input:          PathBuf,

    /// Per-instruction elapsed times, one per line (default: 1.0 each)
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    elapsed:        Option<PathBuf>,

    /// Alternate memory capacity in bytes
    #[arg(short, long)]
    #[arg(value_parser = clap::value_parser!(ByteSteps))]
    capacity:       ByteSteps,

    #[arg(short, long, default_value_t = 1)]
    #[arg(value_parser = clap::value_parser!(ByteSteps))]
    alignment:      ByteSteps,

    /// Copy bandwidth, in bytes per unit of elapsed time
    #[arg(short, long, default_value_t = 1024.0)]
    #[arg(value_parser = clap::value_parser!(f64))]
    bandwidth:      f64,

    /// Base ordering of buffer intervals
    #[arg(short, long, value_enum, default_value_t = BaseOrder::MemoryBoundedness)]
    order:          BaseOrder,

    /// Search prefetch windows by instruction count instead of cost
    #[arg(long, default_value_t = false)]
    count_picker:   bool,

    #[arg(long, default_value_t = 2)]
    min_overlap:    Time,

    #[arg(long, default_value_t = 32)]
    max_overlap:    Time,

    #[arg(long, default_value_t = 1.0)]
    min_ratio:      f64,

    #[arg(long, default_value_t = 1.5)]
    preferred_ratio: f64,

    #[arg(long, default_value_t = 10.0)]
    max_ratio:      f64,

    /// Slices per prefetch; below 2 disables slicing
    #[arg(short, long, default_value_t = 0)]
    slices:         usize,

    #[arg(long, default_value_t = 1024)]
    min_slice_bytes: ByteSteps,

    #[arg(long, default_value_t = 64)]
    granularity:    ByteSteps,

    /// Never keep a value in alternate memory only for its first uses
    #[arg(long, default_value_t = false)]
    no_eviction:    bool,

    /// Maximum number of repack rounds
    #[arg(short, long, default_value_t = 1)]
    #[arg(value_parser = clap::value_parser!(u32))]
    repacks:        u32,

    /// Seed of the repacker's shuffles
    #[arg(long, default_value_t = 0)]
    seed:           u64,

    /// Number of orderings the repacker tries
    #[arg(short, long, default_value_t = 1)]
    #[arg(value_parser = clap::value_parser!(u32))]
    lives:          u32,

    /// Check the finished plan
    #[arg(short, long, default_value_t = false)]
    verify:         bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Args::parse();
    let vals = MinimalloCSVParser::new(cli.input).read_values()?;
    let elapsed = match &cli.elapsed {
        Some(p) => read_elapsed(p)?,
        None    => vec![],
    };
    let horizon = vals.iter()
        .map(|v| v.live_range().end)
        .max()
        .unwrap_or(0)
        .max(elapsed.len() as Time);
    let mut oracle = TableOracle::uniform(horizon as usize, 1.0, cli.bandwidth);
    for (t, e) in elapsed.iter().enumerate() {
        oracle.set_elapsed(t as Time, *e);
    }
    let program = Program::init(Schedule::straight_line(horizon as usize), vals, &[])?;

    let options = Options {
        capacity:                   cli.capacity,
        alignment:                  cli.alignment,
        picker:                     if cli.count_picker {
            PickerConfig::InstructionCount {
                min_overlap:    cli.min_overlap,
                max_overlap:    cli.max_overlap,
            }
        } else {
            PickerConfig::CostBased {
                min_ratio:          cli.min_ratio,
                preferred_ratio:    cli.preferred_ratio,
                max_ratio:          cli.max_ratio,
            }
        },
        base_order:                 cli.order,
        overrides:                  vec![],
        slicing:                    (cli.slices >= 2).then_some(SliceOptions {
            max_slices:     cli.slices,
            min_bytes:      cli.min_slice_bytes,
            granularity:    cli.granularity,
        }),
        enable_eviction:            !cli.no_eviction,
        max_prefetches_per_value:   None,
        max_repacks:                cli.repacks,
        repack_seed:                cli.seed,
        repack_lives:               cli.lives,
        verify:                     cli.verify,
    };

    let plan = algo::altmem(&program, &oracle, &options)?;
    for (id, chain) in &plan.allocations {
        let epochs = chain.iter()
            .map(|a| match a.chunk() {
                Some(c) => format!("{:?}{}@{}", a.space(), a.interval(), c.offset),
                None    => format!("{:?}{}", a.space(), a.interval()),
            })
            .join(" ");
        println!("{id}: {epochs}");
    }
    println!("{:?}", plan.stats);

    Ok(())
}
