//! Backup inventory and reports over a real directory tree.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use patchctl_core::consolidate::Exclusions;
use patchctl_core::stats::{analyze_all, inventory_archive, render_report_md, scan_inventory};
use patchctl_core::{analyze, Report, ReportMode};

fn write(root: &Path, relative: &str, len: usize) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, vec![b'x'; len]).unwrap();
}

fn exclusions(root: &Path) -> Exclusions {
    Exclusions::new(root, Path::new("backups/consolidated-backups"), &[], Utc::now())
}

fn fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.bak", 100);
    write(dir.path(), "conf/b.bak", 100);
    write(dir.path(), "conf/c.orig", 2048);
    write(dir.path(), "src/main.rs", 10);
    write(dir.path(), "node_modules/pkg/d.bak", 5);
    write(dir.path(), "backups/consolidated-backups/20260101-000000/e.bak", 7);
    dir
}

#[test]
fn inventory_honours_patterns_and_exclusions() {
    let dir = fixture();
    let patterns = vec!["*.bak".to_string(), "*.orig".to_string()];

    let files = scan_inventory(dir.path(), &patterns, &exclusions(dir.path())).unwrap();

    let mut paths: Vec<String> = files.iter().map(|f| f.path.display().to_string()).collect();
    paths.sort();
    assert_eq!(paths, vec!["a.bak", "conf/b.bak", "conf/c.orig"]);
}

#[test]
fn invalid_pattern_is_rejected() {
    let dir = fixture();
    let err = scan_inventory(dir.path(), &["[".to_string()], &exclusions(dir.path()));
    assert!(err.is_err());
}

#[test]
fn summary_and_size_reports() {
    let dir = fixture();
    let files = scan_inventory(dir.path(), &["*.bak".to_string(), "*.orig".to_string()], &exclusions(dir.path())).unwrap();

    let Report::Summary(summary) = analyze(&files, ReportMode::Summary, Utc::now()) else {
        panic!("expected summary");
    };
    assert_eq!(summary.file_count, 3);
    assert_eq!(summary.total_bytes, 2248);

    let Report::SizeAnalysis(size) = analyze(&files, ReportMode::SizeAnalysis, Utc::now()) else {
        panic!("expected size analysis");
    };
    assert_eq!(size.potential_duplicates.len(), 1);
    assert_eq!(size.potential_duplicates[0].size_bytes, 100);
    assert_eq!(size.potential_duplicates[0].paths.len(), 2);
    assert!(!size.note.is_empty());
}

#[tokio::test]
async fn all_reports_in_requested_order() {
    let dir = fixture();
    let files = scan_inventory(dir.path(), &["*.bak".to_string()], &exclusions(dir.path())).unwrap();
    let modes = [ReportMode::SizeAnalysis, ReportMode::Summary, ReportMode::Historical];

    let reports = analyze_all(Arc::new(files), &modes, Utc::now()).await;

    let got: Vec<ReportMode> = reports.iter().map(Report::mode).collect();
    assert_eq!(got, modes.to_vec());
    let Report::Historical(history) = &reports[2] else {
        panic!("expected historical");
    };
    assert_eq!(history.months.len(), 1);
    assert_eq!(history.months[0].count, 2);
    assert!(history.months[0].growth_percent.is_none());
    for report in &reports {
        assert!(render_report_md(report).starts_with("# "));
    }
}

#[test]
fn empty_inventory_yields_empty_reports() {
    let dir = tempfile::tempdir().unwrap();
    let files = scan_inventory(dir.path(), &["*.bak".to_string()], &exclusions(dir.path())).unwrap();
    assert!(files.is_empty());
    for mode in ReportMode::ALL {
        let md = render_report_md(&analyze(&files, mode, Utc::now()));
        assert!(!md.is_empty());
    }
}

#[test]
fn archive_inventory_sees_everything_inside() {
    let dir = fixture();
    let files = inventory_archive(&dir.path().join("backups/consolidated-backups"));
    assert_eq!(files.len(), 1);
    assert!(files[0].path.ends_with("e.bak"));
}
