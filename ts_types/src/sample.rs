use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};

/// How the read pair of a sample was obtained.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ResolutionMethod {
    /// Two paired-read files already present in the derived cache.
    DerivedCacheHit,
    /// The original upload is itself a read pair.
    OriginalPair,
    /// Multiple original fastqs merged into one file per read.
    Concatenated,
    /// A single original bam converted to fastq and cached.
    BamConverted,
}

/// The two files of a paired-end read set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPair {
    pub r1: PathBuf,
    pub r2: PathBuf,
}

impl ReadPair {
    pub fn paths(&self) -> [&Path; 2] {
        [&self.r1, &self.r2]
    }
}

/// A sample whose inputs have been resolved to exactly one read pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub id: String,
    pub inputs: ReadPair,
    pub method: ResolutionMethod,
}

/// The kinds of raw input files the resolver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFileKind {
    PairedRead,
    Alignment,
}

const PAIRED_READ_SUFFIXES: [&str; 4] = [".fastq.gz", ".fq.gz", ".fastq", ".fq"];

impl ReadFileKind {
    /// Classify a file by name; files that are neither reads nor alignments return None.
    pub fn classify(path: &Path) -> Option<ReadFileKind> {
        let name = path.file_name()?.to_str()?;
        if PAIRED_READ_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            Some(ReadFileKind::PairedRead)
        } else if name.ends_with(".bam") {
            Some(ReadFileKind::Alignment)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_classify() {
        for name in ["a_R1.fastq.gz", "b.fq.gz", "c.fastq", "d.fq"] {
            assert_eq!(
                ReadFileKind::classify(Path::new(name)),
                Some(ReadFileKind::PairedRead),
                "{name}"
            );
        }
        assert_eq!(
            ReadFileKind::classify(Path::new("/x/TH01.bam")),
            Some(ReadFileKind::Alignment)
        );
        for name in ["TH01.bam.bai", "md5sums.txt", "fastq"] {
            assert_eq!(ReadFileKind::classify(Path::new(name)), None, "{name}");
        }
    }

    #[test]
    fn test_method_names() {
        assert_eq!(ResolutionMethod::DerivedCacheHit.to_string(), "derived-cache-hit");
        assert_eq!(
            ResolutionMethod::from_str("bam-converted").unwrap(),
            ResolutionMethod::BamConverted
        );
    }
}
