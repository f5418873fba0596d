//! Plain-text session report
//!
//! Output layout (cells right-aligned, one space of padding, `|` after each
//! cell):
//!
//! ```text
//! Active sessions 1
//!  Process Name| Network|  Duration|    Local Addr| ...
//!              |     tcp| 1.204511s| 10.0.0.1:5000| ...
//!
//!
//! Recently completed sessions 0
//!  Process Name| Network| Duration| ...
//! ```
//!
//! Column widths are computed per table, so the two tables align
//! independently.

use std::fmt::Write as _;
use std::time::Duration;

use super::recorder::{SessionSnapshot, SessionsSnapshot};

const HEADER: [&str; 7] = [
    "Process Name",
    "Network",
    "Duration",
    "Local Addr",
    "Remote Addr",
    "Upload Bytes",
    "Download Bytes",
];

/// Render both session tables
#[must_use]
pub fn render_report(snapshot: &SessionsSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Active sessions {}", snapshot.active.len());
    render_table(&mut out, &snapshot.active);
    out.push_str("\n\n");
    let _ = writeln!(out, "Recently completed sessions {}", snapshot.completed.len());
    render_table(&mut out, &snapshot.completed);
    out
}

fn render_table(out: &mut String, sessions: &[SessionSnapshot]) {
    let mut rows: Vec<[String; 7]> = Vec::with_capacity(sessions.len() + 1);
    rows.push(HEADER.map(String::from));
    rows.extend(sessions.iter().map(|s| {
        [
            s.process_name.clone(),
            s.protocol.to_string(),
            format_duration(s.duration),
            s.local.to_string(),
            s.remote.to_string(),
            group_thousands(s.upload),
            group_thousands(s.download),
        ]
    }));

    let mut widths = [0usize; 7];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    for row in &rows {
        for (width, cell) in widths.iter().zip(row) {
            let _ = write!(out, "{cell:>w$}|", w = width + 1);
        }
        out.push('\n');
    }
}

/// Format an integer with `,` every three digits
#[must_use]
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Format a duration the way Go's `time.Duration` prints
///
/// `1h2m3.5s`, `2m0s`, `1.5s`, `250ms`, `12.5µs`, `80ns`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".into();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return with_fraction(nanos, 1_000, 3, "µs");
    }
    if nanos < 1_000_000_000 {
        return with_fraction(nanos, 1_000_000, 6, "ms");
    }

    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    let seconds = with_fraction(
        u128::from(secs) * 1_000_000_000 + u128::from(d.subsec_nanos()),
        1_000_000_000,
        9,
        "s",
    );

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}")
    } else {
        seconds
    }
}

fn with_fraction(value: u128, unit: u128, digits: usize, suffix: &str) -> String {
    let whole = value / unit;
    let frac = value % unit;
    if frac == 0 {
        return format!("{whole}{suffix}");
    }
    let frac = format!("{frac:0digits$}");
    format!("{whole}.{}{suffix}", frac.trim_end_matches('0'))
}
