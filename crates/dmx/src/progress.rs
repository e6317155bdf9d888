//! 📊 progress.rs — "Is the 6 AM file in yet?" — asked every morning, by everyone.
//!
//! Two jobs:
//! - [`ProgressMetrics`]: an `indicatif` bar fed by the file source (bytes read vs file size,
//!   records read, records per second), with a small `comfy-table` block as its message.
//! - [`summary_table`]: the end-of-run scoreboard the CLI prints, win or lose.
//!
//! ⚠️ Watching the bar will not make it go faster. We checked. Twice.
//!
//! 🦆 The duck has nothing to do with this module. It's just vibing.

use std::time::{Duration, Instant};

use comfy_table::presets::{NOTHING, UTF8_FULL};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use crate::pipeline::RunSummary;

// -- 📏 one mebibyte. not a megabyte. there is a difference and this is the hill.
const MIB: u64 = 1024 * 1024;

// -- 🎨 per-line updates are cheap, terminal redraws are not
const RENDER_EVERY: Duration = Duration::from_millis(200);

/// 📦 Bytes, scaled to the size of the whole file so the units don't jump around mid-run.
fn format_bytes(bytes: u64, file_size: u64) -> String {
    if file_size >= 512 * MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if file_size >= MIB {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        // -- 🐛 raw bytes mode. rate files are small. small files need love too.
        format!("{} bytes", bytes)
    }
}

/// 🔢 "1000000" → "1,000,000". You're welcome, eyes.
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS if the file got much bigger than anyone planned.
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// 📊 Progress of one source pass: bytes, records, elapsed time, and a bar to watch.
pub struct ProgressMetrics {
    /// 🏷️ what we are reading, for the header line
    source_name: String,
    /// 📏 file size in bytes, 0 when unknown
    total_size: u64,
    total_bytes: u64,
    total_records: u64,
    progress_bar: ProgressBar,
    start_time: Instant,
    last_render: Option<Instant>,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("ProgressMetrics")
            .field("source_name", &self.source_name)
            .field("total_size", &self.total_size)
            .field("total_bytes", &self.total_bytes)
            .field("total_records", &self.total_records)
            .finish()
    }
}

impl ProgressMetrics {
    /// 🚀 A fresh bar for `source_name`. Pass `total_size = 0` for "no idea".
    pub fn new(source_name: String, total_size: u64) -> Self {
        let progress_bar = ProgressBar::new(total_size);
        // -- 🎨 cyan because it's classy, blue because it's calm
        match ProgressStyle::default_bar().template("{msg}\n| [{bar:40.cyan/blue}]") {
            Ok(style) => progress_bar.set_style(style.progress_chars("=>-")),
            Err(err) => debug!("🎨 progress template rejected, using the default: {err}"),
        }

        Self {
            source_name,
            total_size,
            total_bytes: 0,
            total_records: 0,
            progress_bar,
            start_time: Instant::now(),
            last_render: None,
        }
    }

    /// 🔄 Count what was just read. Redraws at most every 200 ms.
    pub fn update(&mut self, bytes_read: u64, records_read: u64) {
        self.total_bytes += bytes_read;
        self.total_records += records_read;
        self.progress_bar.set_position(self.total_bytes);

        let now = Instant::now();
        let due = self
            .last_render
            .is_none_or(|last| now.duration_since(last) >= RENDER_EVERY);
        if due {
            self.last_render = Some(now);
            self.render();
        }
    }

    /// ✅ EOF. Draw the final numbers and close the bar.
    pub fn finish(&self) {
        if !self.progress_bar.is_finished() {
            self.render();
            self.progress_bar.finish();
        }
    }

    pub fn records(&self) -> u64 {
        self.total_records
    }

    pub fn bytes(&self) -> u64 {
        self.total_bytes
    }

    /// 📐 Percent of the file consumed, 0 when the size is unknown.
    fn percent(&self) -> f64 {
        if self.total_size > 0 {
            (self.total_bytes as f64 / self.total_size as f64) * 100.0
        } else {
            0.0
        }
    }

    /// 🎨 Two little columns under the source name:
    /// ```text
    ///   <records/s>   <records>
    ///   <bytes / size> <%>
    ///   <elapsed>     <remaining>
    /// ```
    fn render(&self) {
        let elapsed = self.start_time.elapsed();
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            self.total_records as f64 / secs
        } else {
            0.0
        };
        let percent = self.percent();
        let remaining = if percent > 0.0 && percent < 100.0 {
            // 🔮 linear extrapolation: assumes the rest of the file looks like the start
            let estimated = secs / (percent / 100.0);
            format_duration(Duration::from_secs_f64((estimated - secs).max(0.0)))
        } else {
            "--:--".to_string()
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} records/s", format_number(rate as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} records", format_number(self.total_records)))
                .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!(
                "{} / {}",
                format_bytes(self.total_bytes, self.total_size),
                format_bytes(self.total_size, self.total_size)
            ))
            .set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2}%", percent)).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(elapsed)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} remaining", remaining)).set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar
            .set_message(format!("source: {}\n{}", self.source_name, table));
    }
}

/// 🏁 The end-of-run scoreboard. Printed whether the run was glorious or not.
pub fn summary_table(summary: &RunSummary) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["📊 run summary", ""]);

    let rows: [(&str, String); 9] = [
        ("passes completed", summary.passes_completed.to_string()),
        ("records read", format_number(summary.records_read)),
        ("documents attempted", format_number(summary.attempted)),
        ("applied", format_number(summary.applied())),
        ("  inserted", format_number(summary.inserted)),
        ("  merged", format_number(summary.merged)),
        ("conflicted", format_number(summary.conflicted)),
        ("failed", format_number(summary.failed)),
        ("bulk requests", format_number(summary.batches)),
    ];
    for (label, value) in rows {
        table.add_row(vec![
            Cell::new(label),
            Cell::new(value).set_alignment(CellAlignment::Right),
        ]);
    }
    let status = match &summary.fatal {
        Some(err) => format!("💀 {err}"),
        None if summary.is_clean() => "✅ clean".to_string(),
        None => "⚠️ completed with item failures".to_string(),
    };
    table.add_row(vec![Cell::new("status"), Cell::new(status)]);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;

    #[test]
    fn the_one_where_big_numbers_get_their_commas() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn the_one_where_durations_grow_an_hour_column_only_when_needed() {
        assert_eq!(format_duration(Duration::from_secs(65)), "01:05");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
    }

    #[test]
    fn the_one_where_bytes_follow_the_file_size() {
        assert_eq!(format_bytes(512, 1_000), "512 bytes");
        assert_eq!(format_bytes(2_048, 2 * MIB), "2.00 KiB");
        assert_eq!(format_bytes(MIB, 1024 * MIB), "1.00 MiB");
    }

    #[test]
    fn the_one_where_the_metrics_count_what_they_are_fed() {
        let mut metrics = ProgressMetrics::new("rates.txt".into(), 100);
        metrics.update(40, 1);
        metrics.update(60, 1);
        assert_eq!(metrics.bytes(), 100);
        assert_eq!(metrics.records(), 2);
        assert!((metrics.percent() - 100.0).abs() < f64::EPSILON);
        metrics.finish();
    }

    #[test]
    fn the_one_where_the_scoreboard_tells_the_truth() {
        let summary = RunSummary {
            attempted: 3,
            inserted: 2,
            merged: 0,
            failed: 1,
            fatal: Some(PipelineError::Cancelled),
            ..RunSummary::default()
        };
        let rendered = summary_table(&summary).to_string();
        assert!(rendered.contains("documents attempted"));
        assert!(rendered.contains("run cancelled"));
    }
}
