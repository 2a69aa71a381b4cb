//! 📊 progress.rs: "Are we there yet?" Every reindex, every time, forever.
//!
//! 🚀 Two things live here:
//! - [`DrainProgress`]: a spinner with a comfy-table block underneath, redrawn while the
//!   coordinator waits for the work queue to empty.
//! - [`render_stats_table`]: the per-entity load/error table printed after a run.
//!
//! ⚠️ Watching the spinner will not make the backlog shrink faster. Science says no.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING, presets::UTF8_FULL};
use indicatif::{ProgressBar, ProgressStyle};

use crate::stats::StatsSnapshot;

/// 🔢 "1000000" → "1,000,000". You're welcome, eyes.
pub(crate) fn format_number(n: u64) -> String {
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

/// ⏱️ MM:SS, or HH:MM:SS if you should probably call your mom.
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// 📡 Drain-phase display: backlog, documents loaded so far, throughput over a 5s window.
pub(crate) struct DrainProgress {
    index_name: String,
    bar: ProgressBar,
    /// 🔄 (timestamp, loaded) samples for the sliding-window rate
    samples: VecDeque<(Instant, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for DrainProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("DrainProgress")
            .field("index_name", &self.index_name)
            .finish()
    }
}

impl DrainProgress {
    pub(crate) fn new(index_name: &str, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        let start_time = Instant::now();
        let mut samples = VecDeque::new();
        samples.push_back((start_time, 0));
        Self {
            index_name: index_name.to_string(),
            bar,
            samples,
            start_time,
        }
    }

    fn docs_per_sec(&mut self, loaded: u64) -> f64 {
        let now = Instant::now();
        let window = Duration::from_secs(5);
        while let Some(&(timestamp, _)) = self.samples.front() {
            if now.duration_since(timestamp) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((now, loaded));
        match self.samples.front() {
            Some(&(oldest, oldest_loaded)) => {
                let elapsed = now.duration_since(oldest).as_secs_f64();
                if elapsed > 0.0 {
                    loaded.saturating_sub(oldest_loaded) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    /// 🔄 Redraw with the latest numbers.
    pub(crate) fn update(&mut self, backlog: usize, loaded: u64, live_workers: usize) {
        let rate = self.docs_per_sec(loaded);
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} Docs/s", format_number(rate as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} Docs", format_number(loaded))).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} backlog", format_number(backlog as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{live_workers} index workers")).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![Cell::new(format!(
            "{} elapsed",
            format_duration(self.start_time.elapsed())
        ))
        .set_alignment(CellAlignment::Right)]);
        self.bar
            .set_message(format!("draining into {}\n{}", self.index_name, table));
        self.bar.tick();
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// 🍽️ entity | loaded | errors, plus a total row.
pub fn render_stats_table(snapshot: &StatsSnapshot) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["entity", "loaded", "errors"]);

    let entities: std::collections::BTreeSet<&String> =
        snapshot.load.keys().chain(snapshot.error.keys()).collect();
    for entity in entities {
        let loaded = snapshot.load.get(entity).copied().unwrap_or(0);
        let errors = snapshot.error.get(entity).copied().unwrap_or(0);
        table.add_row(vec![
            Cell::new(entity),
            Cell::new(format_number(loaded)).set_alignment(CellAlignment::Right),
            Cell::new(format_number(errors)).set_alignment(CellAlignment::Right),
        ]);
    }
    table.add_row(vec![
        Cell::new("total"),
        Cell::new(format_number(snapshot.total_loaded())).set_alignment(CellAlignment::Right),
        Cell::new(format_number(snapshot.total_errors())).set_alignment(CellAlignment::Right),
    ]);
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_big_numbers_get_their_commas() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn the_one_where_long_runs_grow_an_hour_column() {
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
    }

    #[test]
    fn the_one_where_the_stats_table_lists_every_entity_once() {
        let mut snapshot = StatsSnapshot::default();
        snapshot.load.insert("person".into(), 1_500);
        snapshot.error.insert("person".into(), 2);
        snapshot.error.insert("archief".into(), 1);
        let rendered = render_stats_table(&snapshot).to_string();
        assert_eq!(rendered.matches("person").count(), 1);
        assert!(rendered.contains("archief"));
        assert!(rendered.contains("1,500"));
        assert!(rendered.contains("total"));
    }

    #[test]
    fn the_one_where_a_hidden_spinner_still_does_the_math() {
        let mut progress = DrainProgress::new("fiches_1", false);
        progress.update(10, 100, 4);
        progress.update(0, 200, 4);
        progress.finish();
    }
}
