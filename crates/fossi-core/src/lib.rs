//! Core dataset model for the FOSSI repository index.

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fossi-core";

/// Primary languages a repository must report to enter the dataset.
pub const HDL_LANGUAGES: [&str; 3] = ["SystemVerilog", "Verilog", "VHDL"];

/// Display format for repository dates in the emitted dataset.
pub const DATE_FORMAT: &str = "%Y/%m/%d";

pub const DESCRIPTION_MAX_LEN: usize = 96;
pub const TRUNCATION_SUFFIX: &str = "...";

/// Structural tag carried by repositories that are forks.
pub const FORK_TAG: &str = "fork";

/// Language name to byte count, in the order the API reported it.
pub type LanguageBreakdown = IndexMap<String, u64>;

pub fn is_hdl_language(language: &str) -> bool {
    HDL_LANGUAGES.contains(&language)
}

/// HDL subset of a breakdown, preserving the breakdown's key order.
pub fn hdl_languages(breakdown: &LanguageBreakdown) -> Vec<String> {
    breakdown
        .keys()
        .filter(|name| is_hdl_language(name))
        .cloned()
        .collect()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Accepts both `2017/03/05` and the unpadded `2017/3/5`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).ok()
}

/// Cut `content` on a space boundary so it fits `length` characters, then append `suffix`.
///
/// Strings already within `length` characters are returned unchanged. Longer strings keep
/// every whole space-separated word among their first `length + 1` characters.
pub fn smart_truncate(content: &str, length: usize, suffix: &str) -> String {
    if content.chars().count() <= length {
        return content.to_string();
    }
    let head: String = content.chars().take(length + 1).collect();
    let mut words: Vec<&str> = head.split(' ').collect();
    words.pop();
    format!("{}{}", words.join(" "), suffix)
}

/// Maturity marker attached to IP blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityCode {
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// Proven in silicon.
    #[serde(rename = "s")]
    Silicon,
    /// Proven on an FPGA.
    #[serde(rename = "f")]
    Fpga,
}

impl QualityCode {
    /// Map an IP-block table status column to a quality code. Unrecognized statuses are unknown.
    pub fn from_status(status: &str) -> Self {
        match status.trim() {
            "SI" => Self::Silicon,
            "FPGA" => Self::Fpga,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::Silicon => "s",
            Self::Fpga => "f",
        }
    }
}

/// One dataset entry. The same shape is used from extraction through emission; `tags` and
/// `quality` start empty and are filled by later stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRecord {
    /// `owner/repo`, the join key across every table.
    pub name: String,
    pub description: String,
    pub license: String,
    pub languages: Vec<String>,
    pub forks: u64,
    pub stars: u64,
    #[serde(with = "slash_date")]
    pub updated: NaiveDate,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub quality: QualityCode,
}

/// Positional row written to `resp.json` by the fetch stage.
pub type SnapshotRow = (
    String,
    String,
    String,
    Vec<String>,
    u64,
    u64,
    String,
    Vec<String>,
);

/// Positional row written to the published dataset.
pub type DatasetRow<'a> = (
    &'a str,
    &'a str,
    &'a str,
    &'a [String],
    u64,
    u64,
    String,
    &'a [String],
    &'static str,
);

impl RepoRecord {
    pub fn to_snapshot_row(&self) -> SnapshotRow {
        (
            self.name.clone(),
            self.description.clone(),
            self.license.clone(),
            self.languages.clone(),
            self.forks,
            self.stars,
            format_date(self.updated),
            self.tags.clone(),
        )
    }

    /// Returns `None` when the row's date column is not a `YYYY/MM/DD` date.
    pub fn from_snapshot_row(row: SnapshotRow) -> Option<Self> {
        let (name, description, license, languages, forks, stars, updated, tags) = row;
        Some(Self {
            name,
            description,
            license,
            languages,
            forks,
            stars,
            updated: parse_date(&updated)?,
            tags,
            quality: QualityCode::Unknown,
        })
    }

    pub fn to_dataset_row(&self) -> DatasetRow<'_> {
        (
            &self.name,
            &self.description,
            &self.license,
            &self.languages,
            self.forks,
            self.stars,
            format_date(self.updated),
            &self.tags,
            self.quality.as_str(),
        )
    }
}

mod slash_date {
    use chrono::NaiveDate;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_date(*date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_date(&text)
            .ok_or_else(|| D::Error::custom(format!("expected YYYY/MM/DD date, got {text:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RepoRecord {
        RepoRecord {
            name: "acme/cpu-core".into(),
            description: "A tiny core".into(),
            license: "mit".into(),
            languages: vec!["Verilog".into()],
            forks: 2,
            stars: 7,
            updated: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            tags: vec!["rtl".into(), "fork".into()],
            quality: QualityCode::Silicon,
        }
    }

    #[test]
    fn short_descriptions_are_untouched() {
        let exact = "x".repeat(96);
        assert_eq!(smart_truncate(&exact, 96, "..."), exact);
        assert_eq!(smart_truncate("a b c", 96, "..."), "a b c");
    }

    #[test]
    fn long_descriptions_break_on_word_boundary() {
        let long = "abcd ".repeat(20);
        let cut = smart_truncate(&long, DESCRIPTION_MAX_LEN, TRUNCATION_SUFFIX);
        assert_eq!(cut, format!("{}...", vec!["abcd"; 19].join(" ")));
        assert!(!cut.contains("ab..."));
    }

    #[test]
    fn boundary_at_position_97_keeps_the_preceding_word() {
        let long = format!("{} {}", "a".repeat(96), "tail");
        assert_eq!(smart_truncate(&long, 96, "..."), format!("{}...", "a".repeat(96)));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let text = "ü".repeat(96);
        assert_eq!(smart_truncate(&text, 96, "..."), text);
    }

    #[test]
    fn quality_codes_map_from_status() {
        assert_eq!(QualityCode::from_status("SI"), QualityCode::Silicon);
        assert_eq!(QualityCode::from_status("FPGA"), QualityCode::Fpga);
        assert_eq!(QualityCode::from_status("sim"), QualityCode::Unknown);
        assert_eq!(QualityCode::from_status(""), QualityCode::Unknown);
    }

    #[test]
    fn hdl_subset_preserves_breakdown_order() {
        let mut breakdown = LanguageBreakdown::new();
        breakdown.insert("VHDL".into(), 10);
        breakdown.insert("Python".into(), 500);
        breakdown.insert("Verilog".into(), 300);
        assert_eq!(hdl_languages(&breakdown), vec!["VHDL", "Verilog"]);
    }

    #[test]
    fn unpadded_dates_parse() {
        assert_eq!(parse_date("2017/3/5"), NaiveDate::from_ymd_opt(2017, 3, 5));
        assert_eq!(parse_date("2017/03/05"), NaiveDate::from_ymd_opt(2017, 3, 5));
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn dataset_row_has_fixed_field_order() {
        let json = serde_json::to_value(record().to_dataset_row()).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                "acme/cpu-core",
                "A tiny core",
                "mit",
                ["Verilog"],
                2,
                7,
                "2024/03/05",
                ["rtl", "fork"],
                "s"
            ])
        );
    }

    #[test]
    fn snapshot_row_restores_record_without_quality() {
        let original = record();
        let restored = RepoRecord::from_snapshot_row(original.to_snapshot_row()).unwrap();
        assert_eq!(restored.quality, QualityCode::Unknown);
        assert_eq!(restored.updated, original.updated);
        assert_eq!(restored.tags, vec!["rtl", "fork"]);
    }
}
