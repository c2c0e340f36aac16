//! Backup statistics: read-only reports over an inventory of artifact files.
//!
//! The inventory comes from the same scanning rules the consolidator uses
//! (or from an archive directory). Reports are pure functions of the
//! inventory and a reference time, so the four modes can be computed
//! concurrently.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::consolidate::scan::{walk_matching, Exclusions, FoundFile};
use crate::consolidate::CleanupTarget;
use crate::error::{PatchError, Result};

/// Number of entries in [`DetailedReport::largest`].
pub const LARGEST_FILES: usize = 10;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

impl From<FoundFile> for BackupFile {
    fn from(found: FoundFile) -> Self {
        Self {
            path: found.path,
            size_bytes: found.size_bytes,
            modified: found.modified,
        }
    }
}

/// Inventory every file under `root` whose name matches one of `patterns`,
/// regardless of age. Read-only.
pub fn scan_inventory(root: &Path, patterns: &[String], exclusions: &Exclusions) -> Result<Vec<BackupFile>> {
    let targets = patterns
        .iter()
        .map(|p| CleanupTarget::new(".", 0, p))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| PatchError::InvalidRequest(e.to_string()))?;
    Ok(inventory_for_targets(root, &targets, exclusions))
}

/// Inventory everything the given targets match, ignoring their age limits.
pub fn inventory_for_targets(root: &Path, targets: &[CleanupTarget], exclusions: &Exclusions) -> Vec<BackupFile> {
    let cancel = CancellationToken::new();
    let mut files: BTreeMap<PathBuf, BackupFile> = BTreeMap::new();
    for target in targets {
        let outcome = walk_matching(root, target.path(), exclusions, &cancel, |rel| target.matches(rel));
        for error in outcome.errors {
            tracing::debug!(error = %error, "inventory scan error");
        }
        for found in outcome.files {
            files.entry(found.path.clone()).or_insert_with(|| found.into());
        }
    }
    files.into_values().collect()
}

/// Inventory every file inside an archive directory (e.g. the consolidated
/// backups root).
pub fn inventory_archive(archive: &Path) -> Vec<BackupFile> {
    let exclusions = Exclusions::new(archive, Path::new(".patchctl-no-archive"), &[], Utc::now());
    walk_matching(archive, Path::new("."), &exclusions, &CancellationToken::new(), |_| true)
        .files
        .into_iter()
        .map(BackupFile::from)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    Summary,
    Detailed,
    Historical,
    SizeAnalysis,
}

impl ReportMode {
    pub const ALL: [ReportMode; 4] = [
        ReportMode::Summary,
        ReportMode::Detailed,
        ReportMode::Historical,
        ReportMode::SizeAnalysis,
    ];
}

impl FromStr for ReportMode {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "summary" => Ok(ReportMode::Summary),
            "detailed" => Ok(ReportMode::Detailed),
            "historical" => Ok(ReportMode::Historical),
            "size" | "size_analysis" => Ok(ReportMode::SizeAnalysis),
            other => Err(PatchError::InvalidRequest(format!("unknown report mode: {other}"))),
        }
    }
}

/// Count and bytes of a group of files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub count: usize,
    pub bytes: u64,
}

impl Bucket {
    fn add(&mut self, file: &BackupFile) {
        self.count += 1;
        self.bytes += file.size_bytes;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub file_count: usize,
    pub total_bytes: u64,
    pub average_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeBucket {
    Last24Hours,
    LastWeek,
    LastMonth,
    LastYear,
    Older,
}

impl AgeBucket {
    pub fn of(modified: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let age = now - modified;
        if age <= Duration::hours(24) {
            AgeBucket::Last24Hours
        } else if age <= Duration::days(7) {
            AgeBucket::LastWeek
        } else if age <= Duration::days(30) {
            AgeBucket::LastMonth
        } else if age <= Duration::days(365) {
            AgeBucket::LastYear
        } else {
            AgeBucket::Older
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AgeBucket::Last24Hours => "last 24 hours",
            AgeBucket::LastWeek => "last week",
            AgeBucket::LastMonth => "last month",
            AgeBucket::LastYear => "last year",
            AgeBucket::Older => "older",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedReport {
    pub summary: SummaryReport,
    pub by_extension: BTreeMap<String, Bucket>,
    pub by_age: BTreeMap<AgeBucket, Bucket>,
    pub largest: Vec<BackupFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthBucket {
    /// `YYYY-MM`.
    pub month: String,
    pub count: usize,
    pub bytes: u64,
    /// Byte growth against the previous month; `None` when that month had
    /// no bytes.
    pub growth_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalReport {
    /// Consecutive months from the oldest to the newest file; empty months
    /// are included with zero counts.
    pub months: Vec<MonthBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeRange {
    /// Under 1 KiB.
    Tiny,
    /// Under 1 MiB.
    Small,
    /// Under 10 MiB.
    Medium,
    /// Under 100 MiB.
    Large,
    Huge,
}

impl SizeRange {
    pub fn of(size_bytes: u64) -> Self {
        if size_bytes < KIB {
            SizeRange::Tiny
        } else if size_bytes < MIB {
            SizeRange::Small
        } else if size_bytes < 10 * MIB {
            SizeRange::Medium
        } else if size_bytes < 100 * MIB {
            SizeRange::Large
        } else {
            SizeRange::Huge
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SizeRange::Tiny => "tiny (< 1 KiB)",
            SizeRange::Small => "small (< 1 MiB)",
            SizeRange::Medium => "medium (< 10 MiB)",
            SizeRange::Large => "large (< 100 MiB)",
            SizeRange::Huge => "huge (>= 100 MiB)",
        }
    }
}

/// Files that share a byte length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub size_bytes: u64,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeReport {
    pub ranges: BTreeMap<SizeRange, Bucket>,
    pub potential_duplicates: Vec<DuplicateGroup>,
    pub note: String,
}

const DUPLICATE_NOTE: &str = "Potential duplicates share an identical byte length only. Contents are not compared, so false positives are expected; verify before deleting anything.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Report {
    Summary(SummaryReport),
    Detailed(DetailedReport),
    Historical(HistoricalReport),
    SizeAnalysis(SizeReport),
}

impl Report {
    pub fn mode(&self) -> ReportMode {
        match self {
            Report::Summary(_) => ReportMode::Summary,
            Report::Detailed(_) => ReportMode::Detailed,
            Report::Historical(_) => ReportMode::Historical,
            Report::SizeAnalysis(_) => ReportMode::SizeAnalysis,
        }
    }
}

/// Compute one report.
pub fn analyze(files: &[BackupFile], mode: ReportMode, now: DateTime<Utc>) -> Report {
    match mode {
        ReportMode::Summary => Report::Summary(summary(files)),
        ReportMode::Detailed => Report::Detailed(detailed(files, now)),
        ReportMode::Historical => Report::Historical(historical(files)),
        ReportMode::SizeAnalysis => Report::SizeAnalysis(size_analysis(files)),
    }
}

/// Compute several reports concurrently, in the order of `modes`.
pub async fn analyze_all(files: Arc<Vec<BackupFile>>, modes: &[ReportMode], now: DateTime<Utc>) -> Vec<Report> {
    let tasks = modes.iter().copied().map(|mode| {
        let files = Arc::clone(&files);
        async move {
            match tokio::task::spawn_blocking({
                let files = Arc::clone(&files);
                move || analyze(&files, mode, now)
            })
            .await
            {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!(?mode, error = %e, "report task failed; computing inline");
                    analyze(&files, mode, now)
                }
            }
        }
    });
    futures::future::join_all(tasks).await
}

fn summary(files: &[BackupFile]) -> SummaryReport {
    let total_bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
    SummaryReport {
        file_count: files.len(),
        total_bytes,
        average_bytes: if files.is_empty() { 0 } else { total_bytes / files.len() as u64 },
        oldest: files.iter().map(|f| f.modified).min(),
        newest: files.iter().map(|f| f.modified).max(),
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "(none)".to_string())
}

fn detailed(files: &[BackupFile], now: DateTime<Utc>) -> DetailedReport {
    let mut by_extension: BTreeMap<String, Bucket> = BTreeMap::new();
    let mut by_age: BTreeMap<AgeBucket, Bucket> = BTreeMap::new();
    for file in files {
        by_extension.entry(extension_of(&file.path)).or_default().add(file);
        by_age.entry(AgeBucket::of(file.modified, now)).or_default().add(file);
    }

    let mut largest = files.to_vec();
    largest.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then_with(|| a.path.cmp(&b.path)));
    largest.truncate(LARGEST_FILES);

    DetailedReport {
        summary: summary(files),
        by_extension,
        by_age,
        largest,
    }
}

fn month_start(at: DateTime<Utc>) -> NaiveDate {
    NaiveDate::from_ymd_opt(at.year(), at.month(), 1).unwrap_or(NaiveDate::MIN)
}

fn next_month(month: NaiveDate) -> NaiveDate {
    let (year, m) = if month.month() == 12 {
        (month.year() + 1, 1)
    } else {
        (month.year(), month.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, m, 1).unwrap_or(NaiveDate::MAX)
}

fn historical(files: &[BackupFile]) -> HistoricalReport {
    let mut per_month: BTreeMap<NaiveDate, Bucket> = BTreeMap::new();
    for file in files {
        per_month.entry(month_start(file.modified)).or_default().add(file);
    }
    let (Some(first), Some(last)) = (
        per_month.keys().next().copied(),
        per_month.keys().next_back().copied(),
    ) else {
        return HistoricalReport { months: Vec::new() };
    };

    let mut months = Vec::new();
    let mut previous_bytes: Option<u64> = None;
    let mut cursor = first;
    while cursor <= last {
        let bucket = per_month.get(&cursor).copied().unwrap_or_default();
        let growth_percent = match previous_bytes {
            Some(prev) if prev > 0 => Some((bucket.bytes as f64 - prev as f64) / prev as f64 * 100.0),
            _ => None,
        };
        months.push(MonthBucket {
            month: cursor.format("%Y-%m").to_string(),
            count: bucket.count,
            bytes: bucket.bytes,
            growth_percent,
        });
        previous_bytes = Some(bucket.bytes);
        cursor = next_month(cursor);
    }
    HistoricalReport { months }
}

fn size_analysis(files: &[BackupFile]) -> SizeReport {
    let mut ranges: BTreeMap<SizeRange, Bucket> = BTreeMap::new();
    let mut by_size: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
    for file in files {
        ranges.entry(SizeRange::of(file.size_bytes)).or_default().add(file);
        if file.size_bytes > 0 {
            by_size.entry(file.size_bytes).or_default().push(file.path.clone());
        }
    }
    let potential_duplicates = by_size
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .map(|(size_bytes, mut paths)| {
            paths.sort();
            DuplicateGroup { size_bytes, paths }
        })
        .collect();
    SizeReport {
        ranges,
        potential_duplicates,
        note: DUPLICATE_NOTE.to_string(),
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn render_summary(md: &mut String, s: &SummaryReport) {
    let _ = writeln!(md, "- Files: {}", s.file_count);
    let _ = writeln!(md, "- Total size: {}", human_bytes(s.total_bytes));
    let _ = writeln!(md, "- Average size: {}", human_bytes(s.average_bytes));
    if let (Some(oldest), Some(newest)) = (s.oldest, s.newest) {
        let _ = writeln!(md, "- Oldest: {}", oldest.format("%Y-%m-%d"));
        let _ = writeln!(md, "- Newest: {}", newest.format("%Y-%m-%d"));
    }
}

/// Render a report as Markdown.
pub fn render_report_md(report: &Report) -> String {
    let mut md = String::new();
    match report {
        Report::Summary(s) => {
            let _ = writeln!(md, "# Backup summary\n");
            render_summary(&mut md, s);
        }
        Report::Detailed(d) => {
            let _ = writeln!(md, "# Backup details\n");
            render_summary(&mut md, &d.summary);
            let _ = writeln!(md, "\n## By extension\n\n| Extension | Files | Size |\n|---|---|---|");
            for (ext, bucket) in &d.by_extension {
                let _ = writeln!(md, "| {ext} | {} | {} |", bucket.count, human_bytes(bucket.bytes));
            }
            let _ = writeln!(md, "\n## By age\n\n| Age | Files | Size |\n|---|---|---|");
            for (age, bucket) in &d.by_age {
                let _ = writeln!(md, "| {} | {} | {} |", age.label(), bucket.count, human_bytes(bucket.bytes));
            }
            let _ = writeln!(md, "\n## Largest files\n");
            for file in &d.largest {
                let _ = writeln!(md, "- `{}` ({})", file.path.display(), human_bytes(file.size_bytes));
            }
        }
        Report::Historical(h) => {
            let _ = writeln!(md, "# Backup history\n\n| Month | Files | Size | Growth |\n|---|---|---|---|");
            for month in &h.months {
                let growth = month
                    .growth_percent
                    .map(|g| format!("{g:+.1}%"))
                    .unwrap_or_else(|| "n/a".to_string());
                let _ = writeln!(md, "| {} | {} | {} | {growth} |", month.month, month.count, human_bytes(month.bytes));
            }
        }
        Report::SizeAnalysis(s) => {
            let _ = writeln!(md, "# Backup sizes\n\n| Range | Files | Size |\n|---|---|---|");
            for (range, bucket) in &s.ranges {
                let _ = writeln!(md, "| {} | {} | {} |", range.label(), bucket.count, human_bytes(bucket.bytes));
            }
            let _ = writeln!(md, "\n## Potential duplicates\n\n> {}\n", s.note);
            if s.potential_duplicates.is_empty() {
                let _ = writeln!(md, "_none_");
            }
            for group in &s.potential_duplicates {
                let paths: Vec<String> = group.paths.iter().map(|p| format!("`{}`", p.display())).collect();
                let _ = writeln!(md, "- {}: {}", human_bytes(group.size_bytes), paths.join(", "));
            }
        }
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn file(path: &str, size: u64, modified: DateTime<Utc>) -> BackupFile {
        BackupFile {
            path: PathBuf::from(path),
            size_bytes: size,
            modified,
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn summary_of_empty_inventory() {
        let Report::Summary(s) = analyze(&[], ReportMode::Summary, Utc::now()) else {
            panic!("wrong report variant");
        };
        assert_eq!(s.file_count, 0);
        assert_eq!(s.average_bytes, 0);
        assert!(s.oldest.is_none());
    }

    #[test]
    fn detailed_groups_by_extension_and_age() {
        let now = at(2026, 3, 31);
        let files = vec![
            file("a.bak", 100, now - Duration::hours(2)),
            file("b.BAK", 300, now - Duration::days(3)),
            file("c.orig", 50, now - Duration::days(400)),
            file("README", 10, now - Duration::days(20)),
        ];
        let Report::Detailed(d) = analyze(&files, ReportMode::Detailed, now) else {
            panic!("wrong report variant");
        };
        assert_eq!(d.by_extension["bak"], Bucket { count: 2, bytes: 400 });
        assert_eq!(d.by_extension["(none)"].count, 1);
        assert_eq!(d.by_age[&AgeBucket::Last24Hours].count, 1);
        assert_eq!(d.by_age[&AgeBucket::LastWeek].count, 1);
        assert_eq!(d.by_age[&AgeBucket::LastMonth].count, 1);
        assert_eq!(d.by_age[&AgeBucket::Older].count, 1);
        assert_eq!(d.largest[0].path, PathBuf::from("b.BAK"));
    }

    #[test]
    fn historical_fills_gaps_and_computes_growth() {
        let files = vec![
            file("a", 100, at(2026, 1, 5)),
            file("b", 150, at(2026, 3, 9)),
            file("c", 150, at(2026, 4, 1)),
        ];
        let Report::Historical(h) = analyze(&files, ReportMode::Historical, Utc::now()) else {
            panic!("wrong report variant");
        };
        let months: Vec<&str> = h.months.iter().map(|m| m.month.as_str()).collect();
        assert_eq!(months, vec!["2026-01", "2026-02", "2026-03", "2026-04"]);
        assert_eq!(h.months[0].growth_percent, None);
        assert_eq!(h.months[1].growth_percent, Some(-100.0));
        assert_eq!(h.months[2].growth_percent, None);
        assert_eq!(h.months[3].growth_percent, Some(0.0));
    }

    #[test]
    fn historical_crosses_year_boundary() {
        let files = vec![file("a", 10, at(2025, 12, 1)), file("b", 20, at(2026, 1, 1))];
        let Report::Historical(h) = analyze(&files, ReportMode::Historical, Utc::now()) else {
            panic!("wrong report variant");
        };
        assert_eq!(h.months.len(), 2);
        assert_eq!(h.months[1].growth_percent, Some(100.0));
    }

    #[test]
    fn size_analysis_flags_same_length_files_only() {
        let now = Utc::now();
        let files = vec![
            file("x.bak", 2048, now),
            file("y.bak", 2048, now),
            file("z.bak", 10, now),
            file("empty1", 0, now),
            file("empty2", 0, now),
        ];
        let Report::SizeAnalysis(s) = analyze(&files, ReportMode::SizeAnalysis, now) else {
            panic!("wrong report variant");
        };
        assert_eq!(s.potential_duplicates.len(), 1);
        assert_eq!(s.potential_duplicates[0].paths, vec![PathBuf::from("x.bak"), PathBuf::from("y.bak")]);
        assert_eq!(s.ranges[&SizeRange::Tiny].count, 3);
        assert_eq!(s.ranges[&SizeRange::Small].count, 2);
        assert!(s.note.contains("false positives"));
    }

    #[tokio::test]
    async fn analyze_all_preserves_mode_order() {
        let files = Arc::new(vec![file("a.bak", 1, Utc::now())]);
        let reports = analyze_all(files, &ReportMode::ALL, Utc::now()).await;
        let modes: Vec<ReportMode> = reports.iter().map(Report::mode).collect();
        assert_eq!(modes, ReportMode::ALL.to_vec());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("size".parse::<ReportMode>().unwrap(), ReportMode::SizeAnalysis);
        assert_eq!("Size-Analysis".parse::<ReportMode>().unwrap(), ReportMode::SizeAnalysis);
        assert!("weekly".parse::<ReportMode>().is_err());
    }

    #[test]
    fn markdown_mentions_heuristic() {
        let report = analyze(&[], ReportMode::SizeAnalysis, Utc::now());
        let md = render_report_md(&report);
        assert!(md.contains("Potential duplicates"));
        assert!(md.contains("_none_"));
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * MIB), "5.0 MiB");
    }
}
