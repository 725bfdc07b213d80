//! Formatting helpers for CLI output.

use packs_lifecycle::{AnalyzeOutcome, Image};

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// One-line summary of an analysis.
pub fn describe_outcome(outcome: &AnalyzeOutcome) -> String {
    match outcome {
        AnalyzeOutcome::Restored(summary) => format!(
            "Restored {} layer(s) and {} layer config(s) for {} buildpack(s)",
            summary.layers, summary.sidecars, summary.buildpacks
        ),
        AnalyzeOutcome::Skipped(reason) => format!("Skipped analysis ({})", reason),
    }
}

/// Layer count and compressed size of an image.
pub fn describe_image(image: &Image) -> String {
    let size: u64 = image.layers().iter().map(|layer| layer.size).sum();
    format!("{} layer(s), {}", image.layers().len(), format_bytes(size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use packs_lifecycle::{RestoreSummary, SkipReason};

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_describe_outcome() {
        let restored = AnalyzeOutcome::Restored(RestoreSummary {
            buildpacks: 2,
            layers: 1,
            sidecars: 3,
        });
        assert_eq!(
            describe_outcome(&restored),
            "Restored 1 layer(s) and 3 layer config(s) for 2 buildpack(s)"
        );

        let skipped = AnalyzeOutcome::Skipped(SkipReason::NotFound("app".to_string()));
        assert!(describe_outcome(&skipped).starts_with("Skipped analysis"));
    }

    #[test]
    fn test_describe_empty_image() {
        assert_eq!(describe_image(&Image::scratch()), "0 layer(s), 0 B");
    }
}
