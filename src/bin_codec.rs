//! Fixed-layout binary model file
//!
//! Little-endian throughout. Layout:
//!
//! ```text
//! header:
//!     u64 version             = 1
//!     u64 num_byte_len        4 (f32 payload) or 8 (f64 payload)
//!     u64 factor_num          = K
//!     u64 feature_num         set on close; 0 while writing
//!     u64 nonzero_feature_num set on close
//!     u64 success_flag        0 while writing, 1 after a clean close
//!     u64 unit_len            = 3·nbl + 3·K·nbl bytes per unit payload
//! records (repeated):
//!     u16 feature_name_len
//!     u8[feature_name_len]    feature name
//!     u8[unit_len]            w wn wz v[0..K) vn[0..K) vz[0..K)
//! ```
//!
//! The writer emits a provisional header with `success_flag = 0`, appends
//! records, and on [`BinModelWriter::close`] seeks back to just past the
//! version field and rewrites the info block with final counts and
//! `success_flag = 1`. A reader that sees any other flag refuses to load —
//! the file is a crashed write.
//!
//! The bias record comes first, named `bias`, and its payload is zero-padded
//! to `unit_len` even though its logical K is 0; a reader asking for a unit
//! with logical K′ < K consumes and discards the trailing bytes.

#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::store::{ModelStore, ModelUnit, UnitRecord};
use crate::BIAS_FEATURE;

/// On-disk format version.
pub const BIN_MODEL_VERSION: u64 = 1;

/// Byte offset of the info block (just past the version field).
const INFO_OFFSET: u64 = 8;

/// Errors from the binary model codec. All are fatal to the load/save.
#[derive(Debug, thiserror::Error)]
pub enum BinCodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported model version {0}")]
    UnsupportedVersion(u64),
    #[error("model file incomplete (success flag not set)")]
    IncompleteFile,
    #[error("unsupported number byte length {0} (expected 4 or 8)")]
    BadNumByteLen(u64),
    #[error("truncated record")]
    Truncated,
    #[error("factor_num mismatch: file has {file}, expected {expected}")]
    FactorMismatch { file: u64, expected: u64 },
    #[error("first record must be `bias`, got `{0}`")]
    BiasNotFirst(String),
    #[error("feature name of {0} bytes exceeds the u16 length field")]
    NameTooLong(usize),
}

/// Payload precision, from the `-mnt` flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumType {
    F32,
    F64,
}

impl NumType {
    /// Parse a `-mnt` value (`double` or `float`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "double" => Some(NumType::F64),
            "float" => Some(NumType::F32),
            _ => None,
        }
    }

    #[inline]
    pub fn byte_len(self) -> u64 {
        match self {
            NumType::F32 => 4,
            NumType::F64 => 8,
        }
    }

    fn from_byte_len(nbl: u64) -> Result<Self, BinCodecError> {
        match nbl {
            4 => Ok(NumType::F32),
            8 => Ok(NumType::F64),
            other => Err(BinCodecError::BadNumByteLen(other)),
        }
    }
}

/// The header info block after the version field.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinModelInfo {
    pub num_byte_len: u64,
    pub factor_num: u64,
    pub feature_num: u64,
    pub nonzero_feature_num: u64,
    pub success_flag: u64,
    pub unit_len: u64,
}

impl BinModelInfo {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for x in [
            self.num_byte_len,
            self.factor_num,
            self.feature_num,
            self.nonzero_feature_num,
            self.success_flag,
            self.unit_len,
        ] {
            w.write_all(&x.to_le_bytes())?;
        }
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self, BinCodecError> {
        Ok(Self {
            num_byte_len: read_u64(r)?,
            factor_num: read_u64(r)?,
            feature_num: read_u64(r)?,
            nonzero_feature_num: read_u64(r)?,
            success_flag: read_u64(r)?,
            unit_len: read_u64(r)?,
        })
    }
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, BinCodecError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(truncated)?;
    Ok(u64::from_le_bytes(buf))
}

fn truncated(e: io::Error) -> BinCodecError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        BinCodecError::Truncated
    } else {
        BinCodecError::Io(e)
    }
}

fn write_num<W: Write>(w: &mut W, x: f64, num: NumType) -> io::Result<()> {
    match num {
        NumType::F64 => w.write_all(&x.to_le_bytes()),
        NumType::F32 => w.write_all(&(x as f32).to_le_bytes()),
    }
}

fn read_num<R: Read>(r: &mut R, num: NumType) -> Result<f64, BinCodecError> {
    match num {
        NumType::F64 => {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf).map_err(truncated)?;
            Ok(f64::from_le_bytes(buf))
        }
        NumType::F32 => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf).map_err(truncated)?;
            Ok(f32::from_le_bytes(buf) as f64)
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Record-at-a-time binary model writer with the deferred-header protocol.
pub struct BinModelWriter {
    w: BufWriter<File>,
    info: BinModelInfo,
    num: NumType,
    closed: bool,
}

impl BinModelWriter {
    /// Create `path` and write the provisional header (`success_flag = 0`).
    pub fn create(path: &Path, num: NumType, factor_num: u64) -> Result<Self, BinCodecError> {
        let nbl = num.byte_len();
        let info = BinModelInfo {
            num_byte_len: nbl,
            factor_num,
            feature_num: 0,
            nonzero_feature_num: 0,
            success_flag: 0,
            unit_len: 3 * nbl + 3 * factor_num * nbl,
        };
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(&BIN_MODEL_VERSION.to_le_bytes())?;
        info.write_to(&mut w)?;
        Ok(Self {
            w,
            info,
            num,
            closed: false,
        })
    }

    /// Append one record. The payload is zero-padded to `unit_len` when the
    /// record carries fewer than `factor_num` latent slots (the bias case).
    pub fn write_record(&mut self, name: &str, rec: &UnitRecord) -> Result<(), BinCodecError> {
        let name_bytes = name.as_bytes();
        let name_len =
            u16::try_from(name_bytes.len()).map_err(|_| BinCodecError::NameTooLong(name_bytes.len()))?;
        self.w.write_all(&name_len.to_le_bytes())?;
        self.w.write_all(name_bytes)?;

        for x in [rec.w, rec.wn, rec.wz] {
            write_num(&mut self.w, x, self.num)?;
        }
        for arr in [&rec.v, &rec.vn, &rec.vz] {
            for &x in arr.iter() {
                write_num(&mut self.w, x, self.num)?;
            }
        }

        let nbl = self.num.byte_len();
        let written = 3 * nbl + 3 * rec.v.len() as u64 * nbl;
        let pad = self.info.unit_len - written;
        if pad > 0 {
            self.w.write_all(&vec![0u8; pad as usize])?;
        }

        self.info.feature_num += 1;
        if rec.is_nonzero() {
            self.info.nonzero_feature_num += 1;
        }
        Ok(())
    }

    /// Finalize: rewind past the version field and rewrite the info block
    /// with the final counts and `success_flag = 1`.
    pub fn close(mut self) -> Result<(), BinCodecError> {
        self.info.success_flag = 1;
        self.w.seek(SeekFrom::Start(INFO_OFFSET))?;
        self.info.write_to(&mut self.w)?;
        self.w.flush()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for BinModelWriter {
    fn drop(&mut self) {
        if !self.closed {
            // success_flag stays 0; readers will refuse the file
            tracing::warn!("binary model writer dropped without close, file left incomplete");
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Record-at-a-time binary model reader.
pub struct BinModelReader {
    r: BufReader<File>,
    info: BinModelInfo,
    num: NumType,
}

impl BinModelReader {
    /// Open `path` and validate the header. Refuses version mismatches,
    /// unknown payload widths, and files whose success flag was never set.
    pub fn open(path: &Path) -> Result<Self, BinCodecError> {
        let mut r = BufReader::new(File::open(path)?);
        let version = read_u64(&mut r)?;
        if version != BIN_MODEL_VERSION {
            return Err(BinCodecError::UnsupportedVersion(version));
        }
        let info = BinModelInfo::read_from(&mut r)?;
        if info.success_flag != 1 {
            return Err(BinCodecError::IncompleteFile);
        }
        let num = NumType::from_byte_len(info.num_byte_len)?;
        Ok(Self { r, info, num })
    }

    pub fn info(&self) -> &BinModelInfo {
        &self.info
    }

    /// Read the next record with `logical_k` latent slots, discarding the
    /// trailing `3·(K−K′)·nbl` padding bytes. `Ok(None)` at a clean EOF.
    pub fn read_record(
        &mut self,
        logical_k: usize,
    ) -> Result<Option<(String, UnitRecord)>, BinCodecError> {
        let mut len_buf = [0u8; 2];
        if !fill_or_eof(&mut self.r, &mut len_buf)? {
            return Ok(None);
        }
        let name_len = u16::from_le_bytes(len_buf) as usize;
        let mut name_buf = vec![0u8; name_len];
        self.r.read_exact(&mut name_buf).map_err(truncated)?;
        let name = String::from_utf8_lossy(&name_buf).into_owned();

        let mut rec = UnitRecord {
            w: read_num(&mut self.r, self.num)?,
            wn: read_num(&mut self.r, self.num)?,
            wz: read_num(&mut self.r, self.num)?,
            ..UnitRecord::default()
        };
        for arr in [&mut rec.v, &mut rec.vn, &mut rec.vz] {
            for _ in 0..logical_k {
                arr.push(read_num(&mut self.r, self.num)?);
            }
        }

        let nbl = self.info.num_byte_len;
        let consumed = 3 * nbl + 3 * logical_k as u64 * nbl;
        let skip = self.info.unit_len - consumed;
        if skip > 0 {
            let copied = io::copy(&mut (&mut self.r).take(skip), &mut io::sink())?;
            if copied != skip {
                return Err(BinCodecError::Truncated);
            }
        }
        Ok(Some((name, rec)))
    }
}

/// Fill `buf` completely, or report a clean EOF at the record boundary.
fn fill_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, BinCodecError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            return if filled == 0 {
                Ok(false)
            } else {
                Err(BinCodecError::Truncated)
            };
        }
        filled += n;
    }
    Ok(true)
}

/// Header-only probe for the bin tool. Validates the version but reports the
/// info block as stored — an unset success flag is data here, not an error.
pub fn read_info(path: &Path) -> Result<BinModelInfo, BinCodecError> {
    let mut r = BufReader::new(File::open(path)?);
    let version = read_u64(&mut r)?;
    if version != BIN_MODEL_VERSION {
        return Err(BinCodecError::UnsupportedVersion(version));
    }
    BinModelInfo::read_from(&mut r)
}

// ============================================================================
// Whole-model save / load
// ============================================================================

/// Serialize the full dual state of `store` to `path`. Bias record first.
pub fn save_model(store: &ModelStore, path: &Path, num: NumType) -> Result<(), BinCodecError> {
    let mut w = BinModelWriter::create(path, num, store.factor_num() as u64)?;
    w.write_record(BIAS_FEATURE, &UnitRecord::from_unit(store.bias()))?;
    let mut failed = None;
    store.for_each_unit(|feature, unit| {
        if failed.is_none() {
            if let Err(e) = w.write_record(feature, &UnitRecord::from_unit(unit)) {
                failed = Some(e);
            }
        }
    });
    if let Some(e) = failed {
        return Err(e);
    }
    w.close()
}

/// Reconstruct `store` from `path`. The file's `factor_num` must equal the
/// store's K; the bias record must come first. Units are staged and only
/// installed after the whole stream read cleanly, so a failed load leaves the
/// store untouched.
pub fn load_model(store: &ModelStore, path: &Path) -> Result<(), BinCodecError> {
    let mut r = BinModelReader::open(path)?;
    let k = store.factor_num();
    if r.info().factor_num != k as u64 {
        return Err(BinCodecError::FactorMismatch {
            file: r.info().factor_num,
            expected: k as u64,
        });
    }

    let (name, bias_rec) = r.read_record(0)?.ok_or(BinCodecError::Truncated)?;
    if name != BIAS_FEATURE {
        return Err(BinCodecError::BiasNotFirst(name));
    }

    let mut staged: Vec<(String, ModelUnit)> = Vec::new();
    while let Some((feature, rec)) = r.read_record(k)? {
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
