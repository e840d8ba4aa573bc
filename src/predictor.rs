//! Frozen-model predictor
//!
//! The predictor reads the same model formats the trainer writes but keeps
//! only what scoring needs: one `w` and one K-vector `v` per feature, plus
//! the bias weight. Features whose `w` and every `v[f]` are exactly zero are
//! dropped at load time — they cannot contribute to any score. The loaded
//! model is immutable, so scoring takes no locks.
//!
//! Output lines are `"<label> <sigmoid(score)>"`. Each batch's results are
//! written as one contiguous block under the writer mutex: lines within a
//! batch keep input order, distinct batches may interleave.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::bin_codec::{BinCodecError, BinModelReader};
use crate::frame::BatchTask;
use crate::kernels::VectorOps;
use crate::sample::{parse_sample, Term};
use crate::txt_codec::{self, TxtCodecError};
use crate::util::{fmt_g6, sigmoid};
use crate::{ModelFormat, ModelIoError, BIAS_FEATURE};

/// One scoring unit: first-order weight and latent factor only.
#[derive(Clone, Debug)]
pub struct PredictUnit {
    pub w: f64,
    pub v: Vec<f64>,
}

/// Immutable scoring model.
pub struct PredictModel {
    bias_w: f64,
    map: HashMap<Box<str>, PredictUnit>,
    factor_num: usize,
}

impl PredictModel {
    /// Load a scoring model from `path`, keeping only nonzero features.
    pub fn load(path: &Path, format: ModelFormat, factor_num: usize) -> Result<Self, ModelIoError> {
        match format {
            ModelFormat::Txt => Ok(Self::load_txt(path, factor_num)?),
            ModelFormat::Bin => Ok(Self::load_bin(path, factor_num)?),
        }
    }

    fn load_txt(path: &Path, factor_num: usize) -> Result<Self, TxtCodecError> {
        let text = std::fs::read_to_string(path)?;
        let mut lines = text.lines();
        let bias_line = lines.next().ok_or(TxtCodecError::EmptyFile)?;
        let bias_rec = txt_codec::parse_bias_line(bias_line, 1)?;

        let mut map = HashMap::new();
        for (idx, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (feature, rec) = txt_codec::parse_unit_line(factor_num, line, idx + 2)?;
            if rec.is_nonzero() {
                map.insert(feature.into_boxed_str(), PredictUnit { w: rec.w, v: rec.v });
            }
        }
        Ok(Self {
            bias_w: bias_rec.w,
            map,
            factor_num,
        })
    }

    fn load_bin(path: &Path, factor_num: usize) -> Result<Self, BinCodecError> {
        let mut r = BinModelReader::open(path)?;
        if r.info().factor_num != factor_num as u64 {
            return Err(BinCodecError::FactorMismatch {
                file: r.info().factor_num,
                expected: factor_num as u64,
            });
        }

        let (name, bias_rec) = r.read_record(0)?.ok_or(BinCodecError::Truncated)?;
        if name != BIAS_FEATURE {
            return Err(BinCodecError::BiasNotFirst(name));
        }

        let mut map = HashMap::new();
        while let Some((feature, rec)) = r.read_record(factor_num)? {
            if rec.is_nonzero() {
                map.insert(feature.into_boxed_str(), PredictUnit { w: rec.w, v: rec.v });
            }
        }
        Ok(Self {
            bias_w: bias_rec.w,
            map,
            factor_num,
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sigmoid score for a sparse sample. Features absent from the model
    /// contribute nothing.
    pub fn score(&self, terms: &[Term], ops: &dyn VectorOps) -> f64 {
        let mut raw = self.bias_w;
        let mut sum = vec![0.0; self.factor_num];
        let mut sum_sqr = 0.0;
        for t in terms {
            if let Some(unit) = self.map.get(t.feature.as_str()) {
                raw += unit.w * t.value;
                ops.axpy(t.value, &unit.v, &mut sum);
                sum_sqr += ops.scaled_sum_squares(&unit.v, t.value);
            }
        }
        raw += 0.5 * (ops.sum_squares(&sum) - sum_sqr);
        sigmoid(raw)
    }
}

/// Predictor options, mirroring the `fm_predict` CLI surface.
#[derive(Clone, Debug)]
pub struct PredictOptions {
    pub model_path: PathBuf,
    pub model_format: ModelFormat,
    pub predict_path: PathBuf,
    pub factor_num: usize,
}

/// Errors constructing the predictor.
#[derive(Debug, thiserror::Error)]
pub enum PredictorError {
    #[error("load model: {0}")]
    Model(#[from] ModelIoError),
    #[error("open predict output: {0}")]
    Output(#[source] io::Error),
}

/// Batch scorer: a frozen model, the injected kernels, and the shared
/// output writer.
pub struct FtrlPredictor {
    model: PredictModel,
    ops: Arc<dyn VectorOps>,
    out: Mutex<BufWriter<File>>,
}

impl FtrlPredictor {
    pub fn new(opt: &PredictOptions, ops: Arc<dyn VectorOps>) -> Result<Self, PredictorError> {
        info!("loading model from {}", opt.model_path.display());
        let model = PredictModel::load(&opt.model_path, opt.model_format, opt.factor_num)?;
        info!("model loaded, {} nonzero features", model.len());
        let out = File::create(&opt.predict_path).map_err(PredictorError::Output)?;
        Ok(Self {
            model,
            ops,
            out: Mutex::new(BufWriter::new(out)),
        })
    }

    pub fn model(&self) -> &PredictModel {
        &self.model
    }

    /// Flush buffered output. Call after the worker pool has drained.
    pub fn finish(&self) -> io::Result<()> {
        self.out.lock().flush()
    }
}

impl BatchTask for FtrlPredictor {
    fn run_batch(&self, lines: &[String]) {
        let mut results = Vec::with_capacity(lines.len());
        for line in lines {
            let sample = match parse_sample(line) {
                Ok(s) => s,
                Err(e) => {
                    warn!("skipping sample: {e}");
                    continue;
                }
            };
            let scored = catch_unwind(AssertUnwindSafe(|| {
                self.model.score(&sample.terms, self.ops.as_ref())
            }));
            match scored {
                Ok(score) => results.push(format!("{} {}", sample.label, fmt_g6(score))),
                Err(_) => error!("scoring panicked; continuing with the next line"),
            }
        }

        let mut out = self.out.lock();
        for r in &results {
            if writeln!(out, "{r}").is_err() {
                error!("failed writing prediction output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin_codec::{self, NumType};
    use crate::kernels::{select, Backend};
    use crate::store::{ModelStore, UnitRecord};
    use crate::trainer::{FtrlTrainer, TrainOptions};
    use crate::util::seeded_rng;

    fn scalar() -> Arc<dyn VectorOps> {
        select(Backend::Scalar)
    }

    fn terms(pairs: &[(&str, f64)]) -> Vec<Term> {
        pairs.iter()
            .map(|(f, v)| Term {
                feature: f.to_string(),
                value: *v,
            })
            .collect()
    }

    /// Score straight from a trainer store, bypassing any codec.
    fn store_score(store: &ModelStore, x: &[Term]) -> f64 {
        let k = store.factor_num();
        let mut raw = store.bias().w.get();
        let mut sum = vec![0.0; k];
        let mut sum_sqr = vec![0.0; k];
        for t in x {
            let u = match store.get(&t.feature) {
                Some(u) => u,
                None => continue,
            };
            raw += u.w.get() * t.value;
            for f in 0..k {
                let d = u.v[f].get() * t.value;
                sum[f] += d;
                sum_sqr[f] += d * d;
            }
        }
        for f in 0..k {
            raw += 0.5 * (sum[f] * sum[f] - sum_sqr[f]);
        }
        sigmoid(raw)
    }

    #[test]
    fn txt_loader_drops_all_zero_features() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.txt");
        std::fs::write(
            &path,
            "bias 0.5 1 2\n\
             dead 0 0 0 10 -3 1 1 0 0\n\
             live 0 0.25 0 10 -3 1 1 0 0\n",
        )
        .unwrap();
        let m = PredictModel::load(&path, ModelFormat::Txt, 2).unwrap();
        assert_eq!(m.len(), 1);
        let s_live = m.score(&terms(&[("live", 1.0)]), scalar().as_ref());
        let s_dead = m.score(&terms(&[("dead", 1.0)]), scalar().as_ref());
        assert_eq!(s_dead, sigmoid(0.5));
        assert!(s_live != s_dead);
    }

    #[test]
    fn absent_features_contribute_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.txt");
        std::fs::write(&path, "bias 0.25 1 2\n").unwrap();
        let m = PredictModel::load(&path, ModelFormat::Txt, 4).unwrap();
        let s = m.score(&terms(&[("ghost", 3.0)]), scalar().as_ref());
        assert_eq!(s, sigmoid(0.25));
    }

    #[test]
    fn prediction_commutes_with_txt_reload() {
        let t = FtrlTrainer::new(
            TrainOptions {
                factor_num: 4,
                ..TrainOptions::default()
            },
            scalar(),
            seeded_rng(Some(11)),
        );
        let lines: Vec<String> = (0..400)
            .map(|i| format!("{} a:1 b:{} c:0.5", if i % 2 == 0 { 1 } else { -1 }, 1.0 + (i % 3) as f64))
            .collect();
        t.run_batch(&lines);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.txt");
        crate::txt_codec::save_model(t.store(), &path).unwrap();
        let m = PredictModel::load(&path, ModelFormat::Txt, 4).unwrap();

        let x = terms(&[("a", 1.0), ("b", 2.0), ("c", 0.5)]);
        let direct = store_score(t.store(), &x);
        let reloaded = m.score(&x, scalar().as_ref());
        assert!(
            (direct - reloaded).abs() < 1e-4,
            "direct {direct} vs reloaded {reloaded}"
        );
    }

    #[test]
    fn prediction_commutes_with_bin_reload() {
        let t = FtrlTrainer::new(
            TrainOptions {
                factor_num: 3,
                ..TrainOptions::default()
            },
            scalar(),
            seeded_rng(Some(12)),
        );
        let lines: Vec<String> = (0..200)
            .map(|i| format!("{} x:1 y:2", if i % 3 == 0 { -1 } else { 1 }))
            .collect();
        t.run_batch(&lines);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        bin_codec::save_model(t.store(), &path, NumType::F64).unwrap();
        let m = PredictModel::load(&path, ModelFormat::Bin, 3).unwrap();

        let x = terms(&[("x", 1.0), ("y", 2.0), ("unseen", 5.0)]);
        let direct = store_score(t.store(), &x);
        let reloaded = m.score(&x, scalar().as_ref());
        // f64 payload preserves every stored value exactly; the only slack
        // left is summation order inside the forward pass
        assert!(
            (direct - reloaded).abs() < 1e-12,
            "direct {direct} vs reloaded {reloaded}"
        );
    }

    #[test]
    fn batch_output_keeps_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("m.txt");
        std::fs::write(&model_path, "bias 1 0 0\n").unwrap();
        let out_path = dir.path().join("pred.txt");

        let p = FtrlPredictor::new(
            &PredictOptions {
                model_path,
                model_format: ModelFormat::Txt,
                predict_path: out_path.clone(),
                factor_num: 0,
            },
            scalar(),
        )
        .unwrap();

        let lines: Vec<String> = vec![
            "1".into(),
            "-1".into(),
            "bogus line".into(),
            "1 f:1".into(),
        ];
        p.run_batch(&lines);
        p.finish().unwrap();

        let out = std::fs::read_to_string(&out_path).unwrap();
        let got: Vec<&str> = out.lines().collect();
        assert_eq!(got.len(), 3); // bogus line skipped
        assert!(got[0].starts_with("1 "));
        assert!(got[1].starts_with("-1 "));
        assert!(got[2].starts_with("1 "));
        let score: f64 = got[0].split_whitespace().nth(1).unwrap().parse().unwrap();
        assert!((score - sigmoid(1.0)).abs() < 1e-5);
    }

    #[test]
    fn bin_loader_respects_nonzero_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        let store = ModelStore::new(2, 0.0, 0.0, seeded_rng(Some(13)));
        store.bias().w.set(0.1);
        // all-zero unit: dropped by the predictor, kept by the trainer loader
        store.insert_loaded("dead", UnitRecord::default().into_unit());
        let live = UnitRecord {
            w: 0.5,
            v: vec![0.0, 0.0],
            vn: vec![0.0, 0.0],
            vz: vec![0.0, 0.0],
            ..UnitRecord::default()
        };
        store.insert_loaded("live", live.into_unit());
        bin_codec::save_model(&store, &path, NumType::F64).unwrap();

        let m = PredictModel::load(&path, ModelFormat::Bin, 2).unwrap();
        assert_eq!(m.len(), 1);
    }
}
