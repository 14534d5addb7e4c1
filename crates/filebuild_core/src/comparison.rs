//! File comparison methods.

use serde::{Deserialize, Serialize};

/**
 * A method for comparing a file at two points in time.
 *
 * The builder uses file comparison to determine whether an input or output
 * file has changed since the last build, in which case the relevant cache
 * entries are invalid.
 *
 * `Metadata` compares a file using its size and modification time. Although
 * it is possible to incorrectly conclude that a file has changed (or even
 * that it has not changed), this is a fast and normally accurate means of
 * comparison, recommended for most use cases. `Hash` compares a SHA-256 hash
 * of the contents, which is very likely to produce a correct result but
 * requires reading the entire file.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileComparison {
    #[default]
    Metadata,
    Hash,
}

impl FileComparison {
    /** The name stored in cache files for this comparison method */
    pub fn as_str(self) -> &'static str {
        match self {
            FileComparison::Metadata => "METADATA",
            FileComparison::Hash => "HASH",
        }
    }

    pub fn parse(name: &str) -> Option<FileComparison> {
        match name {
            "METADATA" => Some(FileComparison::Metadata),
            "HASH" => Some(FileComparison::Hash),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for comparison in [FileComparison::Metadata, FileComparison::Hash] {
            assert_eq!(Some(comparison), FileComparison::parse(comparison.as_str()));
        }
        assert_eq!(None, FileComparison::parse("CHECKSUM"));
    }
}
