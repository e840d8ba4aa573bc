//! Training CLI
//!
//! Reads sample lines from stdin, trains the concurrent FTRL-FM model, and
//! writes the model file on EOF:
//!
//!   cat samples.txt | fm_train -m model.txt -dim 1,1,8 -core 4

#![forbid(unsafe_code)]

use std::env;
use std::io;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fmlearn::bin_codec::NumType;
use fmlearn::kernels::{self, Backend};
use fmlearn::util::seeded_rng;
use fmlearn::{frame, FtrlTrainer, ModelFormat, TrainOptions};

fn train_help() -> &'static str {
    "\
usage: cat sample | fm_train [<options>]

options:
-m <model_path>: set the output model path (required)
-mf <model_format>: set the output model format, txt or bin\tdefault:txt
-dim <k0,k1,k2>: k0=use bias, k1=use 1-way interactions, k2=dim of 2-way interactions\tdefault:1,1,8
-init_stdev <stdev>: stdev for initialization of 2-way factors\tdefault:0.1
-w_alpha <w_alpha>: FTRL learning-rate parameter for w\tdefault:0.05
-w_beta <w_beta>: FTRL learning-rate parameter for w\tdefault:1.0
-w_l1 <w_L1_reg>: L1 regularization of w\tdefault:0.1
-w_l2 <w_L2_reg>: L2 regularization of w\tdefault:5.0
-v_alpha <v_alpha>: FTRL learning-rate parameter for v\tdefault:0.05
-v_beta <v_beta>: FTRL learning-rate parameter for v\tdefault:1.0
-v_l1 <v_L1_reg>: L1 regularization of v\tdefault:0.1
-v_l2 <v_L2_reg>: L2 regularization of v\tdefault:5.0
-core <threads_num>: number of worker threads\tdefault:1
-im <initial_model_path>: warm-start model path
-imf <initial_model_format>: warm-start model format, txt or bin\tdefault:txt
-fvs <force_v_sparse>: if 1, set v = 0 whenever w = 0\tdefault:0
-mnt <model_number_type>: double or float (bin payload)\tdefault:double
-simd <simd_type>: vector backend, scalar or blas\tdefault:scalar
-seed <u64>: RNG seed\tdefault:from OS entropy
"
}

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn die_usage(msg: &str) -> ! {
    eprintln!("{msg}");
    eprint!("{}", train_help());
    process::exit(1)
}

fn parse_f64_flag(args: &[String], key: &str, default: f64) -> f64 {
    match parse_flag(args, key) {
        None => default,
        Some(s) => s
            .parse()
            .unwrap_or_else(|_| die_usage(&format!("invalid {key}: `{s}`"))),
    }
}

/// Parse `-dim k0,k1,k2` into (use_bias, use_first_order, factor_num).
fn parse_dim(s: &str) -> Option<(bool, bool, usize)> {
    let mut it = s.split(',');
    let k0: i64 = it.next()?.parse().ok()?;
    let k1: i64 = it.next()?.parse().ok()?;
    let k2: usize = it.next()?.parse().ok()?;
    if it.next().is_some() {
        return None;
    }
    Some((k0 != 0, k1 != 0, k2))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    let model_path = match parse_flag(&args, "-m") {
        Some(p) => PathBuf::from(p),
        None => die_usage("model path required"),
    };
    let model_format = match ModelFormat::parse(&parse_flag(&args, "-mf").unwrap_or_else(|| "txt".into())) {
        Some(f) => f,
        None => die_usage("invalid -mf (txt or bin)"),
    };

    let dim = parse_flag(&args, "-dim").unwrap_or_else(|| "1,1,8".into());
    let (use_bias, use_first_order, factor_num) = match parse_dim(&dim) {
        Some(d) => d,
        None => die_usage(&format!("invalid -dim `{dim}`")),
    };

    let opt = TrainOptions {
        use_bias,
        use_first_order,
        factor_num,
        init_stdev: parse_f64_flag(&args, "-init_stdev", 0.1),
        w_alpha: parse_f64_flag(&args, "-w_alpha", 0.05),
        w_beta: parse_f64_flag(&args, "-w_beta", 1.0),
        w_l1: parse_f64_flag(&args, "-w_l1", 0.1),
        w_l2: parse_f64_flag(&args, "-w_l2", 5.0),
        v_alpha: parse_f64_flag(&args, "-v_alpha", 0.05),
        v_beta: parse_f64_flag(&args, "-v_beta", 1.0),
        v_l1: parse_f64_flag(&args, "-v_l1", 0.1),
        v_l2: parse_f64_flag(&args, "-v_l2", 5.0),
        force_v_sparse: parse_flag(&args, "-fvs").as_deref() == Some("1"),
        ..TrainOptions::default()
    };

    let workers: usize = match parse_flag(&args, "-core") {
        None => 1,
        Some(s) => s
            .parse()
            .unwrap_or_else(|_| die_usage(&format!("invalid -core: `{s}`"))),
    };

    let num_type = match NumType::parse(&parse_flag(&args, "-mnt").unwrap_or_else(|| "double".into())) {
        Some(n) => n,
        None => die_usage("invalid -mnt (double or float)"),
    };

    let backend = match Backend::parse(&parse_flag(&args, "-simd").unwrap_or_default()) {
        Ok(b) => b,
        Err(e) => die_usage(&e.to_string()),
    };

    let seed = match parse_flag(&args, "-seed") {
        None => None,
        Some(s) => Some(
            s.parse()
                .unwrap_or_else(|_| die_usage(&format!("invalid -seed: `{s}`"))),
        ),
    };

    let ops = kernels::select(backend);
    info!("vector backend: {}", ops.name());
    let trainer = FtrlTrainer::new(opt, ops, seeded_rng(seed));

    if let Some(im) = parse_flag(&args, "-im") {
        let imf = match ModelFormat::parse(&parse_flag(&args, "-imf").unwrap_or_else(|| "txt".into()))
        {
            Some(f) => f,
            None => die_usage("invalid -imf (txt or bin)"),
        };
        info!("loading initial model from {im}");
        trainer
            .load_model(&PathBuf::from(&im), imf)
            .with_context(|| format!("load initial model {im}"))?;
        info!("initial model loaded");
    }

    frame::run(&trainer, io::stdin().lock(), workers);

    info!("writing model to {}", model_path.display());
    trainer
        .save_model(&model_path, model_format, num_type)
        .with_context(|| format!("write model {}", model_path.display()))?;
    info!("model written");
    Ok(())
}
