use serde::{Deserialize, Serialize};

/// A contiguous code region within a script, with the execution count it
/// carried in one snapshot. Ranges with `count > 0` are "executed".
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CoverageRange {
    pub start_offset: u32,
    pub end_offset: u32,
    pub count: u64,
}

impl CoverageRange {
    pub fn new(start_offset: u32, end_offset: u32, count: u64) -> Self {
        Self {
            start_offset,
            end_offset,
            count,
        }
    }

    pub fn is_executed(&self) -> bool {
        self.count > 0
    }
}

/// Range-level coverage for one function of a script.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionCoverage {
    pub function_name: String,
    pub ranges: Vec<CoverageRange>,
}

/// Coverage reported for one script, identified by its URL as the profiling
/// backend saw it (file URL, absolute path, or relative name).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptCoverage {
    pub url: String,
    pub functions: Vec<FunctionCoverage>,
}

/// One raw snapshot from the profiling session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CoverageSample {
    pub scripts: Vec<ScriptCoverage>,
}

impl CoverageSample {
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// The set-membership unit for "ever seen" / "ever executed" tracking:
/// the `(url, start, end)` triple serialized as a string.
pub fn range_key(url: &str, range: &CoverageRange) -> String {
    format!("{}:{}:{}", url, range.start_offset, range.end_offset)
}
