//! FTRL-Proximal trainer for the factorization machine
//!
//! ## Per-sample update
//! One training step runs six phases, strictly in order within a worker:
//!
//! 1. materialize `w` from its dual `(wz, wn)` (proximal soft-threshold),
//! 2. materialize `v[f]` from `(vz[f], vn[f])`,
//! 3. forward pass `p` (first-order term + low-rank bilinear interaction),
//! 4. logistic loss gradient coefficient `mult`,
//! 5. dual update for `w` (the bias slot uses `x = 1`),
//! 6. dual update for `v[f]`.
//!
//! Phases 1, 2, 5, 6 mutate unit fields under the unit's stripe lock from
//! [`crate::locks::LockPool`]; two stripe locks are never held at once.
//! Phase 3 reads `w`/`v` without locks — Hogwild-style stale reads are
//! deliberate and the `AtomicF64` cells keep every individual read
//! well-formed. Across samples and workers no ordering is promised: the
//! final model is a function of the race outcomes.
//!
//! The force-v-sparse option zeroes a feature's latent factor whenever its
//! first-order weight sits at exactly zero, and re-draws the factor when the
//! weight comes back.

#![forbid(unsafe_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use tracing::{error, warn};

use crate::bin_codec::{self, NumType};
use crate::frame::BatchTask;
use crate::kernels::VectorOps;
use crate::locks::LockPool;
use crate::sample::{parse_sample, Term};
use crate::store::{ModelStore, ModelUnit};
use crate::txt_codec;
use crate::util::{sgn, sigmoid};
use crate::{ModelFormat, ModelIoError};

/// Training hyperparameters, mirroring the `fm_train` CLI surface.
#[derive(Clone, Debug)]
pub struct TrainOptions {
    /// `k0`: train the bias term.
    pub use_bias: bool,
    /// `k1`: train first-order weights.
    pub use_first_order: bool,
    /// `k2`: latent factor dimension K.
    pub factor_num: usize,
    pub init_mean: f64,
    pub init_stdev: f64,
    pub w_alpha: f64,
    pub w_beta: f64,
    pub w_l1: f64,
    pub w_l2: f64,
    pub v_alpha: f64,
    pub v_beta: f64,
    pub v_l1: f64,
    pub v_l2: f64,
    /// `fvs`: zero a latent factor while its first-order weight is zero.
    pub force_v_sparse: bool,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            use_bias: true,
            use_first_order: true,
            factor_num: 8,
            init_mean: 0.0,
            init_stdev: 0.1,
            w_alpha: 0.05,
            w_beta: 1.0,
            w_l1: 0.1,
            w_l2: 5.0,
            v_alpha: 0.05,
            v_beta: 1.0,
            v_l1: 0.1,
            v_l2: 5.0,
            force_v_sparse: false,
        }
    }
}

/// Concurrent FTRL trainer: the model store, the stripe locks, and the
/// injected vector kernels.
pub struct FtrlTrainer {
    store: ModelStore,
    locks: LockPool,
    ops: Arc<dyn VectorOps>,
    opt: TrainOptions,
}

impl FtrlTrainer {
    pub fn new(opt: TrainOptions, ops: Arc<dyn VectorOps>, rng: StdRng) -> Self {
        let store = ModelStore::new(opt.factor_num, opt.init_mean, opt.init_stdev, rng);
        Self {
            store,
            locks: LockPool::new(),
            ops,
            opt,
        }
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn options(&self) -> &TrainOptions {
        &self.opt
    }

    /// Warm-start from a previously saved model.
    pub fn load_model(&self, path: &Path, format: ModelFormat) -> Result<(), ModelIoError> {
        match format {
            ModelFormat::Txt => txt_codec::load_model(&self.store, path)?,
            ModelFormat::Bin => bin_codec::load_model(&self.store, path)?,
        }
        Ok(())
    }

    /// Serialize the full dual state. `num` picks the binary payload
    /// precision and is ignored for text.
    pub fn save_model(
        &self,
        path: &Path,
        format: ModelFormat,
        num: NumType,
    ) -> Result<(), ModelIoError> {
        match format {
            ModelFormat::Txt => txt_codec::save_model(&self.store, path)?,
            ModelFormat::Bin => bin_codec::save_model(&self.store, path, num)?,
        }
        Ok(())
    }

    /// One FTRL step for the sample `(y, x)`. `y` is `+1` or `−1`; terms
    /// carry nonzero values (the parser guarantees both).
    pub fn train_one(&self, y: i32, x: &[Term]) {
        let k = self.opt.factor_num;
        let m = x.len();
        let bias = Arc::clone(self.store.bias());
        let units: Vec<Arc<ModelUnit>> = x
            .iter()
            .map(|t| self.store.get_or_insert(&t.feature))
            .collect();

        // Phase 1: materialize w for every touched slot (bias is slot m).
        for i in 0..=m {
            let (unit, gated_in) = if i < m {
                (&units[i], self.opt.use_first_order)
            } else {
                (&bias, self.opt.use_bias)
            };
            if !gated_in {
                continue;
            }
            let _guard = if i < m {
                self.locks.feature_lock(&x[i].feature).lock()
            } else {
                self.locks.bias_lock().lock()
            };
            let wz = unit.wz.get();
            if wz.abs() <= self.opt.w_l1 {
                unit.w.set(0.0);
            } else {
                if self.opt.force_v_sparse && unit.wn.get() > 0.0 && unit.w.get() == 0.0 {
                    // weight resurfaces: give the factor a fresh start
                    self.store.redraw_factors(unit);
                }
                let wn = unit.wn.get();
                let w = -(wz - sgn(wz) * self.opt.w_l1)
                    / (self.opt.w_l2 + (self.opt.w_beta + wn.sqrt()) / self.opt.w_alpha);
                unit.w.set(w);
            }
        }

        // Phase 2: materialize v[f] wherever its accumulator is live.
        for (i, term) in x.iter().enumerate() {
            let unit = &units[i];
            let lock = self.locks.feature_lock(&term.feature);
            for f in 0..k {
                let _guard = lock.lock();
                if unit.vn[f].get() > 0.0 {
                    if self.opt.force_v_sparse && unit.w.get() == 0.0 {
                        unit.v[f].set(0.0);
                    } else {
                        let vz = unit.vz[f].get();
                        if vz.abs() <= self.opt.v_l1 {
                            unit.v[f].set(0.0);
                        } else {
                            let vn = unit.vn[f].get();
                            let v = -(vz - sgn(vz) * self.opt.v_l1)
                                / (self.opt.v_l2
                                    + (self.opt.v_beta + vn.sqrt()) / self.opt.v_alpha);
                            unit.v[f].set(v);
                        }
                    }
                }
            }
        }

        // Phase 3: forward pass. No locks; w/v reads are individually atomic.
        let xv: Vec<f64> = x.iter().map(|t| t.value).collect();
        let wv: Vec<f64> = units.iter().map(|u| u.w.get()).collect();
        let mut p = bias.w.get() + self.ops.dot(&wv, &xv);

        let mut sum = vec![0.0; k];
        let mut v_snap = Vec::with_capacity(k);
        let mut sum_sqr = 0.0;
        for (i, term) in x.iter().enumerate() {
            units[i].copy_v_into(&mut v_snap);
            self.ops.axpy(term.value, &v_snap, &mut sum);
            sum_sqr += self.ops.scaled_sum_squares(&v_snap, term.value);
        }
        p += 0.5 * (self.ops.sum_squares(&sum) - sum_sqr);

        // Phase 4: logistic loss gradient coefficient.
        let y = f64::from(y);
        let mult = y * (sigmoid(p * y) - 1.0);

        // Phase 5: dual update for w (bias slot uses x = 1).
        for i in 0..=m {
            let (unit, xi, gated_in) = if i < m {
                (&units[i], x[i].value, self.opt.use_first_order)
            } else {
                (&bias, 1.0, self.opt.use_bias)
            };
            if !gated_in {
                continue;
            }
            let _guard = if i < m {
                self.locks.feature_lock(&x[i].feature).lock()
            } else {
                self.locks.bias_lock().lock()
            };
            let g = mult * xi;
            let wn = unit.wn.get();
            let s = ((wn + g * g).sqrt() - wn.sqrt()) / self.opt.w_alpha;
            unit.wz.set(unit.wz.get() + g - s * unit.w.get());
            unit.wn.set(wn + g * g);
        }

        // Phase 6: dual update for v, using the sum[f] cached in phase 3.
        for (i, term) in x.iter().enumerate() {
            let unit = &units[i];
            let xi = term.value;
            let lock = self.locks.feature_lock(&term.feature);
            for f in 0..k {
                let _guard = lock.lock();
                let vif = unit.v[f].get();
                let g = mult * (sum[f] * xi - vif * xi * xi);
                let vn = unit.vn[f].get();
                let s = ((vn + g * g).sqrt() - vn.sqrt()) / self.opt.v_alpha;
                unit.vz[f].set(unit.vz[f].get() + g - s * vif);
                unit.vn[f].set(vn + g * g);
                if self.opt.force_v_sparse && unit.vn[f].get() > 0.0 && unit.w.get() == 0.0 {
                    unit.v[f].set(0.0);
                }
            }
        }
    }
}

impl BatchTask for FtrlTrainer {
    /// Train every line of the batch in order. A malformed line degrades that
    /// sample only; a panicking step is logged and the worker moves on.
    fn run_batch(&self, lines: &[String]) {
        for line in lines {
            let sample = match parse_sample(line) {
                Ok(s) => s,
                Err(e) => {
                    warn!("skipping sample: {e}");
                    continue;
                }
            };
            let step = catch_unwind(AssertUnwindSafe(|| {
                self.train_one(sample.label, &sample.terms)
            }));
            if step.is_err() {
                error!("training step panicked; continuing with the next line");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{select, Backend};
    use crate::util::seeded_rng;

    fn trainer(opt: TrainOptions) -> FtrlTrainer {
        FtrlTrainer::new(opt, select(Backend::Scalar), seeded_rng(Some(3)))
    }

    fn run_lines(t: &FtrlTrainer, lines: &[&str]) {
        let lines: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        t.run_batch(&lines);
    }

    #[test]
    fn bias_only_training_learns_the_majority_label() {
        // two positives, one negative, bias term only
        let t = trainer(TrainOptions {
            use_bias: true,
            use_first_order: false,
            factor_num: 0,
            w_alpha: 0.1,
            w_beta: 1.0,
            w_l1: 0.0,
            w_l2: 0.0,
            ..TrainOptions::default()
        });
        run_lines(&t, &["1", "1", "-1"]);
        let score = sigmoid(t.store().bias().w.get());
        assert!(score > 0.5 && score < 1.0, "score {score}");
    }

    #[test]
    fn single_feature_converges_on_repetition() {
        let t = trainer(TrainOptions {
            factor_num: 0,
            w_l1: 0.0,
            w_l2: 0.0,
            ..TrainOptions::default()
        });
        let lines: Vec<String> = (0..10_000).map(|_| "1 a:1".to_string()).collect();
        t.run_batch(&lines);
        let a = t.store().get_or_insert("a");
        let score = sigmoid(t.store().bias().w.get() + a.w.get());
        assert!(score > 0.99, "score {score}");
    }

    #[test]
    fn heavy_l1_keeps_first_order_weights_at_exact_zero() {
        let t = trainer(TrainOptions {
            w_l1: 10.0,
            ..TrainOptions::default()
        });
        run_lines(&t, &["1 a:1 b:1"]);
        assert_eq!(t.store().get_or_insert("a").w.get(), 0.0);
        assert_eq!(t.store().get_or_insert("b").w.get(), 0.0);
    }

    #[test]
    fn force_v_sparse_zeroes_dead_factors() {
        // two features so the interaction gradient is nonzero and vn goes live
        let t = trainer(TrainOptions {
            w_l1: 100.0,
            force_v_sparse: true,
            factor_num: 4,
            ..TrainOptions::default()
        });
        run_lines(&t, &["-1 a:1 b:1"]);
        for name in ["a", "b"] {
            let u = t.store().get_or_insert(name);
            assert_eq!(u.w.get(), 0.0);
            assert!(u.wn.get() > 0.0);
            for f in 0..4 {
                assert!(u.vn[f].get() > 0.0, "{name} vn[{f}] stayed zero");
                assert_eq!(u.v[f].get(), 0.0, "{name} v[{f}] not zeroed");
            }
        }
    }

    #[test]
    fn force_v_sparse_single_feature_with_zero_stdev() {
        // a lone feature has zero interaction gradient; with σ = 0 the factor
        // is born at zero and must stay there
        let t = trainer(TrainOptions {
            w_l1: 100.0,
            force_v_sparse: true,
            factor_num: 4,
            init_stdev: 0.0,
            ..TrainOptions::default()
        });
        run_lines(&t, &["-1 a:1"]);
        let u = t.store().get_or_insert("a");
        assert_eq!(u.w.get(), 0.0);
        for f in 0..4 {
            assert_eq!(u.v[f].get(), 0.0);
        }
    }

    #[test]
    fn accumulators_stay_nonnegative_and_proximal_rule_holds() {
        let t = trainer(TrainOptions::default());
        let lines: Vec<String> = (0..500)
            .map(|i| {
                let y = if i % 3 == 0 { 1 } else { -1 };
                format!("{y} f{}:{} f{}:0.5 g:1", i % 17, 0.1 + (i % 5) as f64, i % 7)
            })
            .collect();
        t.run_batch(&lines);

        // wn/vn are sums of squared gradients and must never go negative,
        // and every weight must stay finite
        let check = |unit: &ModelUnit| {
            assert!(unit.wn.get() >= 0.0);
            assert!(unit.w.get().is_finite() && unit.wz.get().is_finite());
            for f in 0..unit.factor_num() {
                assert!(unit.vn[f].get() >= 0.0);
                assert!(unit.v[f].get().is_finite() && unit.vz[f].get().is_finite());
            }
        };
        check(t.store().bias());
        t.store().for_each_unit(|_, u| check(u));
    }

    #[test]
    fn proximal_rule_holds_at_materialization() {
        // single step from zero duals: w is materialized with |wz| = 0 ≤ λ1,
        // phase 5 cannot push |wz| past λ1 = 10 in one step, so the stored
        // zero stays consistent with the rule
        let t = trainer(TrainOptions {
            w_l1: 10.0,
            factor_num: 2,
            ..TrainOptions::default()
        });
        run_lines(&t, &["1 a:1", "-1 a:1"]);
        let u = t.store().get_or_insert("a");
        assert!(u.wz.get().abs() <= 10.0);
        assert_eq!(u.w.get(), 0.0);
    }

    #[test]
    fn label_only_line_trains_bias_only() {
        let t = trainer(TrainOptions::default());
        run_lines(&t, &["1", "-1"]);
        assert!(t.store().is_empty());
        assert!(t.store().bias().wn.get() > 0.0);
    }

    #[test]
    fn all_zero_values_train_nothing() {
        let t = trainer(TrainOptions::default());
        run_lines(&t, &["1 a:0 b:0"]);
        // zero-valued terms never reach the store; only the bias moves
        assert!(t.store().is_empty());
    }

    #[test]
    fn malformed_lines_degrade_one_sample_only() {
        let t = trainer(TrainOptions {
            factor_num: 0,
            ..TrainOptions::default()
        });
        run_lines(&t, &["not-a-label a:1", "1 a:1", "1 a:"]);
        assert_eq!(t.store().len(), 1);
        assert!(t.store().get_or_insert("a").wn.get() > 0.0);
    }

    #[test]
    fn parallel_training_preserves_invariants() {
        let t = Arc::new(trainer(TrainOptions {
            factor_num: 4,
            ..TrainOptions::default()
        }));
        let mut handles = Vec::new();
        for w in 0..8 {
            let t = Arc::clone(&t);
            handles.push(std::thread::spawn(move || {
                let lines: Vec<String> = (0..300)
                    .map(|i| format!("{} f{}:1 f{}:0.5", if (i + w) % 2 == 0 { 1 } else { -1 }, i % 13, (i + 5) % 13))
                    .collect();
                t.run_batch(&lines);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        t.store().for_each_unit(|_, u| {
            assert!(u.wn.get() >= 0.0);
            assert!(u.w.get().is_finite());
            for f in 0..u.factor_num() {
                assert!(u.vn[f].get() >= 0.0);
                assert!(u.v[f].get().is_finite());
            }
        });
    }

    #[test]
    fn repeated_feature_occurrences_are_separate_slots() {
        let t = trainer(TrainOptions {
            factor_num: 0,
            w_l1: 0.0,
            ..TrainOptions::default()
        });
        run_lines(&t, &["1 a:1 a:1"]);
        let u = t.store().get_or_insert("a");
        // p = 0 on the first step, so mult = σ(0) − 1 = −0.5 exactly; each of
        // the two slots contributes g = −0.5 to wz and g² = 0.25 to wn
        assert_eq!(u.wn.get(), 0.5);
        assert_eq!(u.wz.get(), -1.0);
    }
}
