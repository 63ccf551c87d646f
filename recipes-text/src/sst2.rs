//! Reader for the SST-2 directory layout.
//!
//! `SST-2/train.tsv` and `SST-2/dev.tsv` hold labeled rows whose columns
//! are named by the configuration; `SST-2/test.tsv` holds `index, sentence`
//! rows without labels. Every file starts with a header row.

use recipes_core::Result;
use recipes_core::error::DatasetError;
use std::fmt;
use std::path::{Path, PathBuf};

pub const SST2_DIR: &str = "SST-2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Dev,
    Test,
}

impl Split {
    pub fn file_name(&self) -> &'static str {
        match self {
            Split::Train => "train.tsv",
            Split::Dev => "dev.tsv",
            Split::Test => "test.tsv",
        }
    }

    pub fn is_labeled(&self) -> bool {
        !matches!(self, Split::Test)
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(SST2_DIR).join(self.file_name())
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Dev => write!(f, "dev"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// One raw row: the text and, for labeled splits, the label string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExample {
    pub text: String,
    pub label: Option<String>,
}

/// Column positions of a labeled row.
#[derive(Debug, Clone, Copy)]
pub struct ColumnLayout {
    pub text: usize,
    pub label: usize,
    pub width: usize,
}

/// Read every row of `split` under `root`.
pub fn read_split(root: &Path, split: Split, layout: ColumnLayout) -> Result<Vec<RawExample>> {
    let path = split.path(root);
    let content = std::fs::read_to_string(&path)?;
    let rows = parse_rows(&content, &path, split, layout)?;
    tracing::debug!(split = %split, rows = rows.len(), path = %path.display(), "Read split");
    Ok(rows)
}

/// Parse TSV content; the first line is a header and is skipped.
pub fn parse_rows(
    content: &str,
    path: &Path,
    split: Split,
    layout: ColumnLayout,
) -> Result<Vec<RawExample>, DatasetError> {
    let malformed = |line: usize, reason: String| DatasetError::MalformedRow {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut rows = Vec::new();
    for (i, line) in content.lines().enumerate().skip(1) {
        let line_no = i + 1;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let row = if split.is_labeled() {
            if fields.len() != layout.width {
                return Err(malformed(
                    line_no,
                    format!("expected {} columns, found {}", layout.width, fields.len()),
                ));
            }
            RawExample {
                text: fields[layout.text].to_string(),
                label: Some(fields[layout.label].to_string()),
            }
        } else {
            let Some(text) = fields.last().filter(|_| fields.len() >= 2) else {
                return Err(malformed(line_no, "expected index and sentence".to_string()));
            };
            RawExample {
                text: text.to_string(),
                label: None,
            }
        };
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LAYOUT: ColumnLayout = ColumnLayout {
        text: 0,
        label: 1,
        width: 2,
    };

    #[test]
    fn test_labeled_rows_skip_header() {
        let content = "sentence\tlabel\nit 's great \t1\n\nawful .\t0\n";
        let rows = parse_rows(content, Path::new("train.tsv"), Split::Train, LAYOUT).unwrap();
        assert_eq!(
            rows,
            vec![
                RawExample {
                    text: "it 's great ".into(),
                    label: Some("1".into()),
                },
                RawExample {
                    text: "awful .".into(),
                    label: Some("0".into()),
                },
            ]
        );
    }

    #[test]
    fn test_test_split_is_unlabeled() {
        let content = "index\tsentence\n0\tuneasy mishmash\n1\tthis is a film\n";
        let rows = parse_rows(content, Path::new("test.tsv"), Split::Test, LAYOUT).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].text, "this is a film");
        assert!(rows.iter().all(|r| r.label.is_none()));
    }

    #[test]
    fn test_wrong_width_reports_line() {
        let content = "sentence\tlabel\nfine\t1\nbroken row\n";
        let err = parse_rows(content, Path::new("dev.tsv"), Split::Dev, LAYOUT).unwrap_err();
        assert!(matches!(err, DatasetError::MalformedRow { line: 3, .. }));
    }

    #[test]
    fn test_split_paths() {
        assert_eq!(
            Split::Dev.path(Path::new("/data")),
            PathBuf::from("/data/SST-2/dev.tsv")
        );
    }
}
