//! Prediction CLI
//!
//! Scores sample lines from stdin against a saved model and writes
//! `"<label> <score>"` lines to the output file:
//!
//!   cat samples.txt | fm_predict -m model.txt -dim 8 -out pred.txt

#![forbid(unsafe_code)]

use std::env;
use std::io;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fmlearn::kernels::{self, Backend};
use fmlearn::{frame, FtrlPredictor, ModelFormat, PredictOptions};

fn predict_help() -> &'static str {
    "\
usage: cat sample | fm_predict [<options>]

options:
-m <model_path>: set the model path (required)
-mf <model_format>: set the model format, txt or bin\tdefault:txt
-dim <factor_num>: dim of 2-way interactions\tdefault:8
-core <threads_num>: number of worker threads\tdefault:1
-out <predict_path>: set the prediction output path (required)
-mnt <model_number_type>: double or float\tdefault:double
-simd <simd_type>: vector backend, scalar or blas\tdefault:scalar
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
    eprint!("{}", predict_help());
    process::exit(1)
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
    let predict_path = match parse_flag(&args, "-out") {
        Some(p) => PathBuf::from(p),
        None => die_usage("predict path required"),
    };
    let model_format = match ModelFormat::parse(&parse_flag(&args, "-mf").unwrap_or_else(|| "txt".into())) {
        Some(f) => f,
        None => die_usage("invalid -mf (txt or bin)"),
    };
    let factor_num: usize = match parse_flag(&args, "-dim") {
        None => 8,
        Some(s) => s
            .parse()
            .unwrap_or_else(|_| die_usage(&format!("invalid -dim: `{s}`"))),
    };
    let workers: usize = match parse_flag(&args, "-core") {
        None => 1,
        Some(s) => s
            .parse()
            .unwrap_or_else(|_| die_usage(&format!("invalid -core: `{s}`"))),
    };
    // -mnt is accepted for interface parity; binary payload width comes from
    // the file header
    if let Some(mnt) = parse_flag(&args, "-mnt") {
        if mnt != "double" && mnt != "float" {
            die_usage("invalid -mnt (double or float)");
        }
    }
    let backend = match Backend::parse(&parse_flag(&args, "-simd").unwrap_or_default()) {
        Ok(b) => b,
        Err(e) => die_usage(&e.to_string()),
    };

    let ops = kernels::select(backend);
    info!("vector backend: {}", ops.name());

    let opt = PredictOptions {
        model_path,
        model_format,
        predict_path,
        factor_num,
    };
    let predictor = FtrlPredictor::new(&opt, ops).context("create predictor")?;

    frame::run(&predictor, io::stdin().lock(), workers);
    predictor.finish().context("flush prediction output")?;
    info!("predictions written to {}", opt.predict_path.display());
    Ok(())
}
