//! Concurrent model store: one lazily-created unit per observed feature
//!
//! ## Shape
//! A read-mostly `RwLock<HashMap>` with a double-checked insert path. Lookups
//! take the read lock only; the first observer of a feature upgrades to the
//! write lock, re-checks, and inserts a freshly-initialized unit. The
//! returned `Arc` handle is address-stable for the process lifetime — units
//! are never evicted.
//!
//! ## Field atomicity
//! Every scalar a unit carries is an [`AtomicF64`]: a `u64`-bits cell with
//! relaxed loads and stores. The trainer's forward pass reads `w` and `v[f]`
//! without holding the unit's stripe lock (deliberate Hogwild-style staleness)
//! and must never observe a torn 64-bit value; all *mutation* happens under
//! the stripe lock assigned by [`crate::locks::LockPool`], so plain
//! load/store cells suffice — no compare-and-swap loops.
//!
//! The bias unit exists from process start; it logically has no latent factor
//! (`v` is empty) but its first-order dual scalars are live.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;

use crate::util::gaussian_with_params;

/// An `f64` cell readable without the owner's lock.
///
/// Stores the IEEE-754 bit pattern in an `AtomicU64`; loads and stores are
/// `Relaxed`. Writers must hold the unit's stripe lock, which is what makes
/// the unsynchronized read-modify-write in [`AtomicF64::set`] callers sound.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    #[inline]
    pub fn new(v: f64) -> Self {
        Self(AtomicU64::new(v.to_bits()))
    }

    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
}

fn zeroed(k: usize) -> Box<[AtomicF64]> {
    (0..k).map(|_| AtomicF64::new(0.0)).collect()
}

/// Per-feature model state: the materialized weights and the FTRL dual
/// accumulators they are reconstructed from.
///
/// Invariants after every completed training step: `wn >= 0`, `vn[f] >= 0`
/// (both are sums of squared gradients), and `|wz| <= l1 ⇒ w == 0` per the
/// proximal rule.
#[derive(Debug)]
pub struct ModelUnit {
    pub w: AtomicF64,
    pub wn: AtomicF64,
    pub wz: AtomicF64,
    pub v: Box<[AtomicF64]>,
    pub vn: Box<[AtomicF64]>,
    pub vz: Box<[AtomicF64]>,
}

impl ModelUnit {
    /// All-zero unit with `k` latent slots (loaders fill the fields in).
    pub fn with_zeros(k: usize) -> Self {
        Self {
            w: AtomicF64::new(0.0),
            wn: AtomicF64::new(0.0),
            wz: AtomicF64::new(0.0),
            v: zeroed(k),
            vn: zeroed(k),
            vz: zeroed(k),
        }
    }

    /// Fresh unit: zero duals, `v[f] ~ N(mean, stdev)`.
    pub fn fresh(k: usize, mean: f64, stdev: f64, rng: &mut StdRng) -> Self {
        let unit = Self::with_zeros(k);
        for vf in unit.v.iter() {
            vf.set(gaussian_with_params(rng, mean, stdev));
        }
        unit
    }

    #[inline]
    pub fn factor_num(&self) -> usize {
        self.v.len()
    }

    /// True when `w` or any `v[f]` is nonzero (the serialized nonzero count).
    pub fn is_nonzero(&self) -> bool {
        if self.w.get() != 0.0 {
            return true;
        }
        self.v.iter().any(|vf| vf.get() != 0.0)
    }

    /// Copy the latent factor into `out` (atomic reads, no lock).
    pub fn copy_v_into(&self, out: &mut Vec<f64>) {
        out.clear();
        out.extend(self.v.iter().map(AtomicF64::get));
    }
}

/// Plain-value snapshot of one unit, the exchange type between the store and
/// the codecs. `v/vn/vz` lengths equal the record's logical factor count
/// (zero for bias).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnitRecord {
    pub w: f64,
    pub wn: f64,
    pub wz: f64,
    pub v: Vec<f64>,
    pub vn: Vec<f64>,
    pub vz: Vec<f64>,
}

impl UnitRecord {
    pub fn from_unit(unit: &ModelUnit) -> Self {
        Self {
            w: unit.w.get(),
            wn: unit.wn.get(),
            wz: unit.wz.get(),
            v: unit.v.iter().map(AtomicF64::get).collect(),
            vn: unit.vn.iter().map(AtomicF64::get).collect(),
            vz: unit.vz.iter().map(AtomicF64::get).collect(),
        }
    }

    pub fn into_unit(self) -> ModelUnit {
        let unit = ModelUnit::with_zeros(self.v.len());
        unit.w.set(self.w);
        unit.wn.set(self.wn);
        unit.wz.set(self.wz);
        for (slot, x) in unit.v.iter().zip(&self.v) {
            slot.set(*x);
        }
        for (slot, x) in unit.vn.iter().zip(&self.vn) {
            slot.set(*x);
        }
        for (slot, x) in unit.vz.iter().zip(&self.vz) {
            slot.set(*x);
        }
        unit
    }

    /// True when `w` or any `v[f]` is nonzero.
    pub fn is_nonzero(&self) -> bool {
        self.w != 0.0 || self.v.iter().any(|&x| x != 0.0)
    }
}

/// Thread-safe feature → [`ModelUnit`] mapping plus the bias unit.
pub struct ModelStore {
    map: RwLock<HashMap<Box<str>, Arc<ModelUnit>>>,
    bias: Arc<ModelUnit>,
    factor_num: usize,
    init_mean: f64,
    init_stdev: f64,
    rng: Mutex<StdRng>,
}

impl ModelStore {
    pub fn new(factor_num: usize, init_mean: f64, init_stdev: f64, rng: StdRng) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            bias: Arc::new(ModelUnit::with_zeros(0)),
            factor_num,
            init_mean,
            init_stdev,
            rng: Mutex::new(rng),
        }
    }

    #[inline]
    pub fn factor_num(&self) -> usize {
        self.factor_num
    }

    /// The bias unit. Logically `K = 0`: its factor arrays are empty.
    #[inline]
    pub fn bias(&self) -> &Arc<ModelUnit> {
        &self.bias
    }

    /// Return the unit for `feature`, inserting a freshly-initialized one on
    /// first observation.
    ///
    /// Linearizable first-writer semantics: the Gaussian draws for `v` run
    /// exactly once per feature, and every caller — concurrent ones included
    /// — observes the same handle.
    pub fn get_or_insert(&self, feature: &str) -> Arc<ModelUnit> {
        if let Some(unit) = self.map.read().get(feature) {
            return Arc::clone(unit);
        }

        let mut map = self.map.write();
        if let Some(unit) = map.get(feature) {
            // lost the insert race
            return Arc::clone(unit);
        }
        let mut rng = self.rng.lock();
        let unit = Arc::new(ModelUnit::fresh(
            self.factor_num,
            self.init_mean,
            self.init_stdev,
            &mut rng,
        ));
        drop(rng);
        map.insert(feature.into(), Arc::clone(&unit));
        unit
    }

    /// Look up a unit without inserting.
    pub fn get(&self, feature: &str) -> Option<Arc<ModelUnit>> {
        self.map.read().get(feature).map(Arc::clone)
    }

    /// Re-draw a unit's latent factor from the init distribution. The caller
    /// must hold the unit's stripe lock.
    pub fn redraw_factors(&self, unit: &ModelUnit) {
        let mut rng = self.rng.lock();
        for vf in unit.v.iter() {
            vf.set(gaussian_with_params(&mut *rng, self.init_mean, self.init_stdev));
        }
    }

    /// Install a loaded unit, replacing any existing entry. Load-time only.
    pub fn insert_loaded(&self, feature: &str, unit: ModelUnit) {
        self.map.write().insert(feature.into(), Arc::new(unit));
    }

    /// Number of feature units (bias excluded).
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Visit every feature unit, for serialization. Concurrent mutation is
    /// not permitted while iterating — callers run this after training has
    /// quiesced.
    pub fn for_each_unit<F: FnMut(&str, &ModelUnit)>(&self, mut f: F) {
        let map = self.map.read();
        for (feature, unit) in map.iter() {
            f(feature, unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::seeded_rng;

    fn store(k: usize) -> ModelStore {
        ModelStore::new(k, 0.0, 0.1, seeded_rng(Some(99)))
    }

    #[test]
    fn fresh_unit_has_zero_duals_and_gaussian_factors() {
        let s = store(4);
        let u = s.get_or_insert("f1");
        assert_eq!(u.wn.get(), 0.0);
        assert_eq!(u.wz.get(), 0.0);
        assert_eq!(u.w.get(), 0.0);
        assert_eq!(u.factor_num(), 4);
        for f in 0..4 {
            assert_eq!(u.vn[f].get(), 0.0);
            assert_eq!(u.vz[f].get(), 0.0);
        }
        // stdev 0.1 draws are nonzero with overwhelming probability
        assert!(u.v.iter().any(|vf| vf.get() != 0.0));
    }

    #[test]
    fn bias_has_empty_factor_arrays() {
        let s = store(8);
        assert_eq!(s.bias().factor_num(), 0);
        assert_eq!(s.bias().wn.get(), 0.0);
    }

    #[test]
    fn second_lookup_sees_first_insert() {
        let s = store(2);
        let a = s.get_or_insert("x");
        let b = s.get_or_insert("x");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn concurrent_get_or_insert_is_linearizable() {
        let s = Arc::new(store(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&s);
            handles.push(std::thread::spawn(move || {
                let mut ptrs = Vec::new();
                for i in 0..200 {
                    let u = s.get_or_insert(&format!("feat_{}", i % 50));
                    ptrs.push((i % 50, Arc::as_ptr(&u) as usize));
                }
                ptrs
            }));
        }
        let mut seen: HashMap<usize, usize> = HashMap::new();
        for h in handles {
            for (key, ptr) in h.join().unwrap() {
                let prev = seen.entry(key).or_insert(ptr);
                // every caller observed the same unit handle
                assert_eq!(*prev, ptr);
            }
        }
        assert_eq!(s.len(), 50);
    }

    #[test]
    fn atomic_f64_round_trips_bit_patterns() {
        let c = AtomicF64::new(0.0);
        for v in [0.0, -0.0, 1.5, -2.75e-300, f64::MAX] {
            c.set(v);
            assert_eq!(c.get().to_bits(), v.to_bits());
        }
    }

    #[test]
    fn is_nonzero_checks_w_and_factors() {
        let u = ModelUnit::with_zeros(3);
        assert!(!u.is_nonzero());
        u.v[2].set(0.25);
        assert!(u.is_nonzero());
        u.v[2].set(0.0);
        u.w.set(-1.0);
        assert!(u.is_nonzero());
    }
}
