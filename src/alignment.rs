use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};
use crate::{AUX_INPUT_SIZE, NUM_CHROMOSOMES};

/// Auxiliary feature vector: one-hot chromosome, then raw start and end
pub type AuxFeatures = [f32; AUX_INPUT_SIZE];

/// Alignment location of one read; the chromosome is always below [`NUM_CHROMOSOMES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentRecord {
    chromosome: usize,
    start: i64,
    end: i64,
}

impl AlignmentRecord {
    /// `None` when `chromosome` has no slot in the one-hot encoding
    pub fn new(chromosome: usize, start: i64, end: i64) -> Option<Self> {
        (chromosome < NUM_CHROMOSOMES).then_some(AlignmentRecord {
            chromosome,
            start,
            end,
        })
    }

    pub fn chromosome(&self) -> usize {
        self.chromosome
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn aux_features(&self) -> AuxFeatures {
        let mut features = [0.0f32; AUX_INPUT_SIZE];
        features[self.chromosome] = 1.0;
        features[NUM_CHROMOSOMES] = self.start as f32;
        features[NUM_CHROMOSOMES + 1] = self.end as f32;
        features
    }
}

/// Lookup from read identifier to its alignment location.
#[derive(Debug, Clone, Default)]
pub struct AlignmentIndex {
    records: HashMap<String, AlignmentRecord>,
}

impl AlignmentIndex {
    /// Parses a `read_id,chromosome,start,end` file without header row.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Self::from_reader(BufReader::new(file), path)
    }

    pub fn from_reader<R: BufRead>(reader: R, path: &Path) -> Result<Self> {
        let mut records = HashMap::new();

        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::io(path, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (read_id, record) = parse_line(line).map_err(|reason| Error::AlignmentParse {
                path: path.to_path_buf(),
                line: i + 1,
                reason,
            })?;
            // last occurrence wins
            records.insert(read_id, record);
        }

        tracing::debug!(path = %path.display(), entries = records.len(), "Loaded alignment data");
        Ok(AlignmentIndex { records })
    }

    pub fn get(&self, read_id: &str) -> Option<&AlignmentRecord> {
        self.records.get(read_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<(String, AlignmentRecord)> for AlignmentIndex {
    fn from_iter<I: IntoIterator<Item = (String, AlignmentRecord)>>(iter: I) -> Self {
        AlignmentIndex {
            records: iter.into_iter().collect(),
        }
    }
}

fn parse_line(line: &str) -> std::result::Result<(String, AlignmentRecord), String> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 4 {
        return Err(format!("expected 4 fields, found {}", parts.len()));
    }

    let chromosome: usize = parts[1]
        .parse()
        .map_err(|_| format!("invalid chromosome `{}`", parts[1]))?;
    let start: i64 = parts[2]
        .parse()
        .map_err(|_| format!("invalid start `{}`", parts[2]))?;
    let end: i64 = parts[3]
        .parse()
        .map_err(|_| format!("invalid end `{}`", parts[3]))?;

    let record = AlignmentRecord::new(chromosome, start, end).ok_or_else(|| {
        format!(
            "chromosome index {chromosome} exceeds {}",
            NUM_CHROMOSOMES - 1
        )
    })?;
    Ok((parts[0].to_string(), record))
}

/// Loads the index when a path is given.
pub fn load_optional(path: Option<&Path>) -> Result<Option<AlignmentIndex>> {
    path.map(AlignmentIndex::from_path).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(text: &str) -> Result<AlignmentIndex> {
        AlignmentIndex::from_reader(Cursor::new(text.as_bytes()), Path::new("aln.csv"))
    }

    #[test]
    fn parses_records() {
        let index = parse("r1,0,100,250\nr2, 24 ,5,9\n\n").unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("r2"), AlignmentRecord::new(24, 5, 9).as_ref());
        assert!(index.get("r3").is_none());
    }

    #[test]
    fn last_duplicate_wins() {
        let index = parse("r1,1,1,2\nr1,3,30,40\n").unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("r1").unwrap().chromosome(), 3);
    }

    #[test]
    fn too_few_fields_fails_with_line_number() {
        let err = parse("r1,1,1,2\nr2,1,1\n").unwrap_err();
        assert!(matches!(err, Error::AlignmentParse { line: 2, .. }));
    }

    #[test]
    fn non_integer_fields_fail() {
        assert!(parse("r1,chr1,1,2\n").is_err());
        assert!(parse("r1,1,x,2\n").is_err());
        assert!(parse("r1,1,1,2.5\n").is_err());
    }

    #[test]
    fn chromosome_out_of_range_fails() {
        assert!(parse("r1,25,1,2\n").is_err());
    }

    #[test]
    fn record_rejects_chromosome_without_slot() {
        assert!(AlignmentRecord::new(NUM_CHROMOSOMES, 0, 1).is_none());
        let last = AlignmentRecord::new(NUM_CHROMOSOMES - 1, 0, 1).unwrap();
        assert_eq!(last.aux_features()[NUM_CHROMOSOMES - 1], 1.0);

        let index: AlignmentIndex = [("r1".to_string(), last)].into_iter().collect();
        assert_eq!(index.get("r1").map(AlignmentRecord::chromosome), Some(24));
    }

    #[test]
    fn aux_features_layout() {
        let record = AlignmentRecord::new(2, 1000, 1150).unwrap();
        let features = record.aux_features();
        assert_eq!(features.len(), NUM_CHROMOSOMES + 2);
        assert_eq!(features.iter().take(NUM_CHROMOSOMES).sum::<f32>(), 1.0);
        assert_eq!(features[2], 1.0);
        assert_eq!(features[NUM_CHROMOSOMES], 1000.0);
        assert_eq!(features[NUM_CHROMOSOMES + 1], 1150.0);
    }
}
