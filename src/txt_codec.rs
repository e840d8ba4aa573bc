//! Whitespace-delimited text model format
//!
//! One record per line, numbers printed with `%.6g` semantics (six
//! significant digits — round trips are exact to about 1e-5 relative).
//!
//! ```text
//! bias w wn wz                                          (exactly 4 tokens)
//! name w v[0] … v[K−1] wn wz vn[0] … vn[K−1] vz[0] … vz[K−1]   (3K+4 tokens)
//! ```
//!
//! A model file begins with the bias line; every further line is a feature
//! line. The trainer loads the full dual state; the predictor reads the same
//! format but keeps only `w` and `v` (see `predictor`).

#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::store::{ModelStore, ModelUnit, UnitRecord};
use crate::util::fmt_g6;
use crate::BIAS_FEATURE;

/// Errors from the text model codec. All are fatal to the load/save.
#[derive(Debug, thiserror::Error)]
pub enum TxtCodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("empty model file")]
    EmptyFile,
    #[error("model file must begin with the bias line, got `{0}`")]
    MissingBias(String),
    #[error("line {line}: expected {expected} tokens, got {got}")]
    TokenCount {
        line: usize,
        expected: usize,
        got: usize,
    },
    #[error("line {line}: unparseable number `{token}`")]
    BadNumber { line: usize, token: String },
}

fn parse_f64(line: usize, token: &str) -> Result<f64, TxtCodecError> {
    token.parse().map_err(|_| TxtCodecError::BadNumber {
        line,
        token: token.to_string(),
    })
}

/// Render the bias record: `bias w wn wz`.
pub fn format_bias_line(rec: &UnitRecord) -> String {
    format!(
        "{BIAS_FEATURE} {} {} {}",
        fmt_g6(rec.w),
        fmt_g6(rec.wn),
        fmt_g6(rec.wz)
    )
}

/// Render a feature record in the `3K+4`-token layout.
pub fn format_unit_line(feature: &str, rec: &UnitRecord) -> String {
    let k = rec.v.len();
    let mut out = String::with_capacity(16 * (3 * k + 4));
    out.push_str(feature);
    out.push(' ');
    out.push_str(&fmt_g6(rec.w));
    for x in &rec.v {
        out.push(' ');
        out.push_str(&fmt_g6(*x));
    }
    out.push(' ');
    out.push_str(&fmt_g6(rec.wn));
    out.push(' ');
    out.push_str(&fmt_g6(rec.wz));
    for arr in [&rec.vn, &rec.vz] {
        for x in arr.iter() {
            out.push(' ');
            out.push_str(&fmt_g6(*x));
        }
    }
    out
}

/// Parse the bias line (`bias w wn wz`). `line_no` is for diagnostics only.
pub fn parse_bias_line(line: &str, line_no: usize) -> Result<UnitRecord, TxtCodecError> {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    if tokens.len() != 4 {
        return Err(TxtCodecError::TokenCount {
            line: line_no,
            expected: 4,
            got: tokens.len(),
        });
    }
    if tokens[0] != BIAS_FEATURE {
        return Err(TxtCodecError::MissingBias(tokens[0].to_string()));
    }
    Ok(UnitRecord {
        w: parse_f64(line_no, tokens[1])?,
        wn: parse_f64(line_no, tokens[2])?,
        wz: parse_f64(line_no, tokens[3])?,
        ..UnitRecord::default()
    })
}

/// Parse a feature line with `k` latent slots into `(name, record)`.
pub fn parse_unit_line(
    k: usize,
    line: &str,
    line_no: usize,
) -> Result<(String, UnitRecord), TxtCodecError> {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    let expected = 3 * k + 4;
    if tokens.len() != expected {
        return Err(TxtCodecError::TokenCount {
            line: line_no,
            expected,
            got: tokens.len(),
        });
    }

    let name = tokens[0].to_string();
    let mut rec = UnitRecord {
        w: parse_f64(line_no, tokens[1])?,
        ..UnitRecord::default()
    };
    for f in 0..k {
        rec.v.push(parse_f64(line_no, tokens[2 + f])?);
    }
    rec.wn = parse_f64(line_no, tokens[2 + k])?;
    rec.wz = parse_f64(line_no, tokens[3 + k])?;
    for f in 0..k {
        rec.vn.push(parse_f64(line_no, tokens[4 + k + f])?);
    }
    for f in 0..k {
        rec.vz.push(parse_f64(line_no, tokens[4 + 2 * k + f])?);
    }
    Ok((name, rec))
}

/// Serialize the full dual state of `store` to `path`. Bias line first.
pub fn save_model(store: &ModelStore, path: &Path) -> Result<(), TxtCodecError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "{}", format_bias_line(&UnitRecord::from_unit(store.bias())))?;
    let mut failed: Option<io::Error> = None;
    store.for_each_unit(|feature, unit| {
        if failed.is_none() {
            if let Err(e) = writeln!(w, "{}", format_unit_line(feature, &UnitRecord::from_unit(unit)))
            {
                failed = Some(e);
            }
        }
    });
    if let Some(e) = failed {
        return Err(e.into());
    }
    w.flush()?;
    Ok(())
}

/// Reconstruct `store` from `path`; K comes from the store. Units are staged
/// and only installed after the whole file parsed, so a failed load leaves
/// the store untouched.
pub fn load_model(store: &ModelStore, path: &Path) -> Result<(), TxtCodecError> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();

    let bias_line = lines.next().ok_or(TxtCodecError::EmptyFile)??;
    let bias_rec = parse_bias_line(&bias_line, 1)?;

    let k = store.factor_num();
    let mut staged: Vec<(String, ModelUnit)> = Vec::new();
    for (idx, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let (feature, rec) = parse_unit_line(k, &line, idx + 2)?;
        staged.push((feature, rec.into_unit()));
    }

    let bias = store.bias();
    bias.w.set(bias_rec.w);
    bias.wn.set(bias_rec.wn);
    bias.wz.set(bias_rec.wz);
    for (feature, unit) in staged {
        store.insert_loaded(&feature, unit);
    }
    Ok(())
}
