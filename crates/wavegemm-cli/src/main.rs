use std::process::ExitCode;

use clap::Parser;

use wavegemm::{
    reference, AdapterSelection, Elem, GemmConfig, Harness, HarnessError, InputPattern, SUPPORTED,
};

/// Relative tolerance for `--verify`. Loose enough for f32 accumulation
/// order differences across tilings, tight enough to catch indexing bugs.
const VERIFY_TOLERANCE: f32 = 1e-3;

#[derive(Parser, Debug)]
#[command(name = "wavegemm", about = "Benchmark wave-intrinsic tiled matmul kernels")]
struct Args {
    /// Rows of the left matrix and of the result.
    #[arg(short, long, default_value_t = 512)]
    m: u32,

    /// Columns of the right matrix and of the result.
    #[arg(short, long, default_value_t = 512)]
    n: u32,

    /// Shared inner dimension.
    #[arg(short, long, default_value_t = 512)]
    k: u32,

    /// K-step per tile pass; must match the chosen kernel's step.
    #[arg(long, default_value_t = 16)]
    tile_k: u32,

    /// Comma-separated kernel variant names to benchmark in order.
    #[arg(long, value_delimiter = ',', default_value = "simd_16x2_1x8")]
    kernels: Vec<String>,

    /// Dispatches per measurement frame.
    #[arg(long, default_value_t = 20)]
    iterations: u32,

    /// Measurement frames per kernel; the best time is reported.
    #[arg(long, default_value_t = 1)]
    frames: u32,

    /// Input fill: "ones" or "ramp".
    #[arg(long, default_value = "ones")]
    pattern: String,

    /// Element width of the matrix buffers: "f32" or "f16".
    #[arg(long, default_value = "f32")]
    elem: String,

    /// Adapter override, e.g. "discrete:0" or "integrated:0". Defaults to
    /// the highest-scoring adapter.
    #[arg(long)]
    adapter: Option<String>,

    /// Check the GPU result against a CPU reference product.
    #[arg(long)]
    verify: bool,

    /// List the supported kernel variant names and exit.
    #[arg(long)]
    list_kernels: bool,
}

fn parse_pattern(name: &str) -> Result<InputPattern, String> {
    match name {
        "ones" => Ok(InputPattern::Ones),
        "ramp" => Ok(InputPattern::Ramp),
        other => Err(format!("unknown input pattern `{other}`")),
    }
}

fn parse_elem(name: &str) -> Result<Elem, String> {
    match name {
        "f32" => Ok(Elem::F32),
        "f16" => Ok(Elem::F16),
        other => Err(format!("unknown element width `{other}`")),
    }
}

fn parse_adapter(arg: Option<&str>) -> Result<AdapterSelection, String> {
    let Some(arg) = arg else {
        return Ok(AdapterSelection::HighestScore);
    };
    let (kind, index) = arg.split_once(':').unwrap_or((arg, "0"));
    let index: usize = index.parse().map_err(|_| format!("bad adapter index in `{arg}`"))?;
    match kind {
        "discrete" => Ok(AdapterSelection::DiscreteGpu(index)),
        "integrated" => Ok(AdapterSelection::IntegratedGpu(index)),
        other => Err(format!("unknown adapter kind `{other}`, expected discrete or integrated")),
    }
}

fn gflops(m: u32, n: u32, k: u32, iterations: u32, secs: f64) -> f64 {
    let flops = 2.0 * m as f64 * n as f64 * k as f64 * iterations as f64;
    flops / secs / 1e9
}

fn verify(harness: &mut Harness, args: &Args, pattern: InputPattern) -> Result<bool, HarnessError> {
    let (m, n, k) = (args.m as usize, args.n as usize, args.k as usize);
    let lhs = reference::fill_f32(pattern, m * k);
    let rhs = reference::fill_f32(pattern, k * n);
    let expected = reference::matmul_f32(&lhs, &rhs, m, n, k);
    let actual = harness.read_result()?;

    let mismatch = expected.iter().zip(&actual).position(|(&want, &got)| {
        let scale = want.abs().max(1.0);
        (want - got).abs() > VERIFY_TOLERANCE * scale
    });
    if let Some(index) = mismatch {
        log::error!(
            "verification failed at element {index}: expected {}, got {}",
            expected[index],
            actual[index],
        );
        return Ok(false);
    }
    Ok(true)
}

fn run(args: &Args) -> Result<bool, HarnessError> {
    let pattern = parse_pattern(&args.pattern)
        .map_err(|reason| HarnessError::InvalidConfig { reason })?;
    let elem = parse_elem(&args.elem).map_err(|reason| HarnessError::InvalidConfig { reason })?;
    let adapter = parse_adapter(args.adapter.as_deref())
        .map_err(|reason| HarnessError::InvalidConfig { reason })?;

    let Some(first) = args.kernels.first() else {
        return Err(HarnessError::InvalidConfig { reason: "no kernels requested".to_string() });
    };
    let config = GemmConfig {
        m: args.m,
        n: args.n,
        k: args.k,
        tile_k: args.tile_k,
        elem,
        pattern,
        kernel: first.clone(),
        adapter,
    };
    let mut harness = Harness::new(config)?;

    let mut all_ok = true;
    for (position, kernel) in args.kernels.iter().enumerate() {
        if position > 0 {
            harness.switch_kernel(kernel)?;
        }
        // One discarded frame absorbs first-use driver work (pipeline warm,
        // cache population) so it does not pollute the measurement.
        harness.run_frame(args.iterations)?;
        harness.wait()?;

        let mut best = None;
        for _ in 0..args.frames.max(1) {
            harness.run_frame(args.iterations)?;
            harness.wait()?;
            let elapsed = harness.frame_time()?;
            best = Some(best.map_or(elapsed, |b: std::time::Duration| b.min(elapsed)));
        }
        // Frames above guarantee at least one reading.
        let Some(best) = best else { continue };

        let secs = best.as_secs_f64();
        let per_dispatch = secs / args.iterations as f64;
        println!(
            "{:<16} {:>10.3} ms/frame {:>10.3} ms/dispatch {:>9.2} GFLOP/s",
            kernel,
            secs * 1e3,
            per_dispatch * 1e3,
            gflops(args.m, args.n, args.k, args.iterations, secs),
        );

        if args.verify {
            let ok = verify(&mut harness, args, pattern)?;
            println!("{:<16} verification {}", kernel, if ok { "passed" } else { "FAILED" });
            all_ok &= ok;
        }
    }

    harness.shutdown()?;
    Ok(all_ok)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.list_kernels {
        for variant in SUPPORTED {
            println!("{}", variant.label());
        }
        return ExitCode::SUCCESS;
    }

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
