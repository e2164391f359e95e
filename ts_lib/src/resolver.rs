//! Resolve a sample id to exactly one read pair.
//!
//! Precedence, first match wins:
//! 1. two paired-read files in the derived cache,
//! 2. two paired-read files in the original upload,
//! 3. an even number (more than two) of original paired-read files, concatenated per read,
//! 4. exactly one original alignment, converted and cached.
//!
//! Anything else is unresolved. Results of 3 and 4 are written into the derived cache, so
//! the expensive paths are taken at most once per sample.

use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::Itertools;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use ts_types::{ReadFileKind, ReadPair, ResolutionMethod, Sample, StorageLayout};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no paired-read or alignment files in {dir:?}")]
    NoInputs { dir: PathBuf },

    #[error("{count} paired-read files in {dir:?} cannot be split into two reads")]
    OddFastqCount { count: usize, dir: PathBuf },

    #[error("{count} alignments in {dir:?}, expected exactly one")]
    MultipleAlignments { count: usize, dir: PathBuf },

    #[error("converting {bam:?} produced {count} read files, expected two")]
    ConversionOutput { bam: PathBuf, count: usize },

    #[error("converting {bam:?} failed")]
    Conversion {
        bam: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("{path:?}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ResolveError + '_ {
    move |source| ResolveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The side-effect free decision of how a sample's reads will be obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionPlan {
    DerivedCacheHit(ReadPair),
    OriginalPair(ReadPair),
    Concatenate {
        stream_1: Vec<PathBuf>,
        stream_2: Vec<PathBuf>,
    },
    ConvertBam(PathBuf),
}

impl ResolutionPlan {
    pub fn method(&self) -> ResolutionMethod {
        match self {
            ResolutionPlan::DerivedCacheHit(_) => ResolutionMethod::DerivedCacheHit,
            ResolutionPlan::OriginalPair(_) => ResolutionMethod::OriginalPair,
            ResolutionPlan::Concatenate { .. } => ResolutionMethod::Concatenated,
            ResolutionPlan::ConvertBam(_) => ResolutionMethod::BamConverted,
        }
    }
}

fn file_names(paths: &[impl AsRef<Path>]) -> String {
    paths
        .iter()
        .map(|p| {
            p.as_ref()
                .file_name()
                .map_or_else(|| p.as_ref().display().to_string(), |n| n.to_string_lossy().into_owned())
        })
        .join(" ")
}

impl fmt::Display for ResolutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.method())?;
        match self {
            ResolutionPlan::DerivedCacheHit(pair) | ResolutionPlan::OriginalPair(pair) => {
                write!(f, "{}", file_names(&pair.paths()))
            }
            ResolutionPlan::Concatenate { stream_1, stream_2 } => write!(
                f,
                "[{}] + [{}]",
                file_names(&stream_1[..]),
                file_names(&stream_2[..])
            ),
            ResolutionPlan::ConvertBam(bam) => write!(f, "{}", file_names(&[bam])),
        }
    }
}

/// Sorted paired-read and alignment files directly inside `dir`. A missing directory is empty.
fn list_inputs(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), ResolveError> {
    let mut reads = Vec::new();
    let mut alignments = Vec::new();
    if !dir.is_dir() {
        return Ok((reads, alignments));
    }
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if !path.is_file() {
            continue;
        }
        match ReadFileKind::classify(&path) {
            Some(ReadFileKind::PairedRead) => reads.push(path),
            Some(ReadFileKind::Alignment) => alignments.push(path),
            None => {}
        }
    }
    reads.sort();
    alignments.sort();
    Ok((reads, alignments))
}

fn pair_of(mut files: Vec<PathBuf>) -> ReadPair {
    let r2 = files.pop().unwrap_or_default();
    let r1 = files.pop().unwrap_or_default();
    ReadPair { r1, r2 }
}

/// Decide how `sample_id` would be resolved without touching anything.
pub fn plan(layout: &StorageLayout, sample_id: &str) -> Result<ResolutionPlan, ResolveError> {
    let (derived, _) = list_inputs(&layout.derived_dir(sample_id))?;
    if derived.len() == 2 {
        return Ok(ResolutionPlan::DerivedCacheHit(pair_of(derived)));
    }

    let dir = layout.original_dir(sample_id);
    let (reads, alignments) = list_inputs(&dir)?;
    match (reads.len(), alignments.len()) {
        (2, _) => Ok(ResolutionPlan::OriginalPair(pair_of(reads))),
        (n, _) if n > 2 && n % 2 == 0 => {
            let (stream_1, stream_2): (Vec<_>, Vec<_>) = reads
                .into_iter()
                .enumerate()
                .partition_map(|(i, path)| {
                    if i % 2 == 0 {
                        itertools::Either::Left(path)
                    } else {
                        itertools::Either::Right(path)
                    }
                });
            Ok(ResolutionPlan::Concatenate { stream_1, stream_2 })
        }
        (_, 1) => Ok(ResolutionPlan::ConvertBam(alignments[0].clone())),
        (_, count) if count > 1 => Err(ResolveError::MultipleAlignments { count, dir }),
        (count, _) if count % 2 == 1 => Err(ResolveError::OddFastqCount { count, dir }),
        _ => Err(ResolveError::NoInputs { dir }),
    }
}

/// Turns an alignment into a read pair.
pub trait FastqConverter {
    /// Write the reads of `bam` into `dest_dir` and return the files produced.
    fn convert(&self, sample_id: &str, bam: &Path, dest_dir: &Path) -> anyhow::Result<Vec<PathBuf>>;
}

pub struct InputResolver<'a> {
    layout: &'a StorageLayout,
    converter: &'a dyn FastqConverter,
}

impl<'a> InputResolver<'a> {
    pub fn new(layout: &'a StorageLayout, converter: &'a dyn FastqConverter) -> InputResolver<'a> {
        InputResolver { layout, converter }
    }

    pub fn resolve(&self, sample_id: &str) -> Result<Sample, ResolveError> {
        let plan = plan(self.layout, sample_id)?;
        log::info!("{sample_id}: resolving via {plan}");
        let method = plan.method();
        let inputs = match plan {
            ResolutionPlan::DerivedCacheHit(pair) | ResolutionPlan::OriginalPair(pair) => pair,
            ResolutionPlan::Concatenate { stream_1, stream_2 } => {
                self.concatenate(sample_id, &stream_1, &stream_2)?
            }
            ResolutionPlan::ConvertBam(bam) => self.convert(sample_id, &bam)?,
        };
        Ok(Sample {
            id: sample_id.to_string(),
            inputs,
            method,
        })
    }

    fn staging(&self, sample_id: &str) -> Result<PathBuf, ResolveError> {
        let staging = self.layout.derived_staging_dir(sample_id);
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(io_error(&staging))?;
        }
        fs::create_dir_all(&staging).map_err(io_error(&staging))?;
        Ok(staging)
    }

    fn concatenate(
        &self,
        sample_id: &str,
        stream_1: &[PathBuf],
        stream_2: &[PathBuf],
    ) -> Result<ReadPair, ResolveError> {
        let staging = self.staging(sample_id)?;
        let r1 = staging.join(format!("{sample_id}_R1.fastq.gz"));
        let r2 = staging.join(format!("{sample_id}_R2.fastq.gz"));
        if let Err(err) = merge_gzipped(stream_1, &r1).and_then(|()| merge_gzipped(stream_2, &r2)) {
            discard(&staging);
            return Err(err);
        }
        self.promote(sample_id, &staging, vec![r1, r2])
    }

    fn convert(&self, sample_id: &str, bam: &Path) -> Result<ReadPair, ResolveError> {
        let staging = self.staging(sample_id)?;
        let produced = match self.converter.convert(sample_id, bam, &staging) {
            Ok(produced) => produced,
            Err(err) => {
                discard(&staging);
                return Err(ResolveError::Conversion {
                    bam: bam.to_path_buf(),
                    source: err.into(),
                });
            }
        };
        let mut reads: Vec<_> = produced
            .into_iter()
            .filter(|p| ReadFileKind::classify(p) == Some(ReadFileKind::PairedRead))
            .collect();
        if reads.len() != 2 {
            discard(&staging);
            return Err(ResolveError::ConversionOutput {
                bam: bam.to_path_buf(),
                count: reads.len(),
            });
        }
        reads.sort();
        self.promote(sample_id, &staging, reads)
    }

    /// Move a complete pair from the staging area into the derived cache, replacing any reads
    /// already cached there. Other derived files are kept.
    fn promote(
        &self,
        sample_id: &str,
        staging: &Path,
        files: Vec<PathBuf>,
    ) -> Result<ReadPair, ResolveError> {
        let derived = self.layout.derived_dir(sample_id);
        fs::create_dir_all(&derived).map_err(io_error(&derived))?;
        let (stale, _) = list_inputs(&derived)?;
        for path in stale {
            fs::remove_file(&path).map_err(io_error(&path))?;
        }
        let mut promoted = Vec::with_capacity(files.len());
        for file in files {
            let dest = derived.join(file.file_name().unwrap_or_default());
            fs::rename(&file, &dest).map_err(io_error(&dest))?;
            promoted.push(dest);
        }
        fs::remove_dir_all(staging).map_err(io_error(staging))?;
        Ok(pair_of(promoted))
    }
}

fn discard(staging: &Path) {
    if let Err(err) = fs::remove_dir_all(staging) {
        log::warn!("unable to remove {}: {err}", staging.display());
    }
}

/// Merge files into one gzip stream. Gzip members concatenate, so compressed inputs are copied
/// verbatim; plain inputs are compressed on the way.
fn merge_gzipped(inputs: &[PathBuf], dest: &Path) -> Result<(), ResolveError> {
    let mut out = BufWriter::new(File::create(dest).map_err(io_error(dest))?);
    for input in inputs {
        let mut reader = BufReader::new(File::open(input).map_err(io_error(input))?);
        if input.extension().map_or(false, |ext| ext == "gz") {
            io::copy(&mut reader, &mut out).map_err(io_error(input))?;
        } else {
            let mut encoder = GzEncoder::new(&mut out, Compression::default());
            io::copy(&mut reader, &mut encoder).map_err(io_error(input))?;
            encoder.finish().map_err(io_error(dest))?;
        }
    }
    out.flush().map_err(io_error(dest))
}

/// Converter used when an alignment is never expected.
pub struct NoConverter;

impl FastqConverter for NoConverter {
    fn convert(&self, _sample_id: &str, bam: &Path, _dest_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        anyhow::bail!("no converter available for {}", bam.display())
    }
}
