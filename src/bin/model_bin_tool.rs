//! Binary model inspection and conversion tool
//!
//! Tasks:
//!   1 — print the header info of a binary model
//!   2 — convert bin to txt
//!   3 — convert bin to txt, keeping only nonzero features
//!   4 — convert txt to bin with a given factor dimension and precision

#![forbid(unsafe_code)]

use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use fmlearn::bin_codec::{BinModelReader, BinModelWriter, NumType, BIN_MODEL_VERSION};
use fmlearn::txt_codec::{format_bias_line, format_unit_line, parse_bias_line, parse_unit_line};
use fmlearn::{bin_codec, BIAS_FEATURE};

fn tool_help() -> &'static str {
    "\
usage: model_bin_tool [<options>]

options:
-task <task_type>: 1-print bin model info
                   2-transfer format, bin to txt
                   3-transfer format, bin to txt, only nonzero features
                   4-transfer format, txt to bin
-im <input_model_path>: set the input model path
-om <output_model_path>: set the output model path for tasks 2,3,4; tasks 2
                         and 3 write to standard output when omitted
-dim <factor_num>: dim of 2-way interactions, for task 4
-mnt <model_number_type>: number type of the bin model for task 4, double or float\tdefault:double
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
    eprint!("{}", tool_help());
    process::exit(1)
}

fn print_info(input: &Path) -> anyhow::Result<()> {
    let info = bin_codec::read_info(input).context("read model header")?;
    println!("format_version: {BIN_MODEL_VERSION}");
    let flavor = match info.num_byte_len {
        8 => "(double)",
        4 => "(float)",
        _ => "",
    };
    println!("number_byte_length: {}{flavor}", info.num_byte_len);
    println!("factor_num: {}", info.factor_num);
    println!("feature_num: {}", info.feature_num);
    println!("nonzero_feature_num: {}", info.nonzero_feature_num);
    println!("success_flag: {}", info.success_flag == 1);
    Ok(())
}

fn bin_to_txt(input: &Path, output: Option<&Path>, only_nonzero: bool) -> anyhow::Result<()> {
    let mut r = BinModelReader::open(input).context("open input model")?;
    let k = r.info().factor_num as usize;

    let mut w: BufWriter<Box<dyn Write>> = match output {
        Some(p) => BufWriter::new(Box::new(File::create(p).context("create output model")?)),
        None => BufWriter::new(Box::new(io::stdout())),
    };

    let (name, bias_rec) = r
        .read_record(0)
        .context("read bias record")?
        .ok_or_else(|| anyhow::anyhow!("model has no records"))?;
    if name != BIAS_FEATURE {
        anyhow::bail!("first record must be `bias`, got `{name}`");
    }
    writeln!(w, "{}", format_bias_line(&bias_rec))?;

    while let Some((feature, rec)) = r.read_record(k).context("read record")? {
        if only_nonzero && !rec.is_nonzero() {
            continue;
        }
        writeln!(w, "{}", format_unit_line(&feature, &rec))?;
    }
    w.flush()?;
    Ok(())
}

fn txt_to_bin(input: &Path, output: &Path, factor_num: usize, num: NumType) -> anyhow::Result<()> {
    let reader = BufReader::new(File::open(input).context("open input model")?);
    let mut lines = reader.lines();

    let bias_line = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty model file"))??;
    let bias_rec = parse_bias_line(&bias_line, 1).context("parse bias line")?;

    let mut w = BinModelWriter::create(output, num, factor_num as u64).context("create output")?;
    w.write_record(BIAS_FEATURE, &bias_rec)?;

    for (idx, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let (feature, rec) =
            parse_unit_line(factor_num, &line, idx + 2).context("parse feature line")?;
        w.write_record(&feature, &rec)?;
    }
    w.close().context("finalize output model")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    let task: u32 = match parse_flag(&args, "-task").and_then(|s| s.parse().ok()) {
        Some(t @ 1..=4) => t,
        _ => die_usage("invalid task"),
    };
    let input = match parse_flag(&args, "-im") {
        Some(p) => p,
        None => die_usage("input model path required"),
    };
    let input = Path::new(&input);
    let output = parse_flag(&args, "-om");
    let output = output.as_deref().map(Path::new);

    match task {
        1 => print_info(input),
        2 => bin_to_txt(input, output, false),
        3 => bin_to_txt(input, output, true),
        4 => {
            let factor_num: usize = match parse_flag(&args, "-dim").and_then(|s| s.parse().ok()) {
                Some(k) => k,
                None => die_usage("dim required for task 4"),
            };
            let out = match output {
                Some(p) => p,
                None => die_usage("output model path required for task 4"),
            };
            let num =
                match NumType::parse(&parse_flag(&args, "-mnt").unwrap_or_else(|| "double".into()))
                {
                    Some(n) => n,
                    None => die_usage("invalid -mnt (double or float)"),
                };
            txt_to_bin(input, out, factor_num, num)
        }
        _ => unreachable!(),
    }
}
