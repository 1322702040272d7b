//! Formatting utilities for table output and age display

use chrono::{DateTime, Utc};

/// Format a timestamp as a human-readable age (e.g., "2d", "5h", "30m", "15s")
pub fn format_age(timestamp: &DateTime<Utc>) -> String {
    format_age_at(timestamp, &Utc::now())
}

fn format_age_at(timestamp: &DateTime<Utc>, now: &DateTime<Utc>) -> String {
    let duration = now.signed_duration_since(*timestamp);

    let total_secs = duration.num_seconds();
    if total_secs < 0 {
        return "0s".to_string();
    }

    let days = duration.num_days();
    if days > 0 {
        return format!("{}d", days);
    }

    let hours = duration.num_hours();
    if hours > 0 {
        return format!("{}h", hours);
    }

    let minutes = duration.num_minutes();
    if minutes > 0 {
        return format!("{}m", minutes);
    }

    format!("{}s", total_secs)
}

/// Render rows as a column-aligned table with headers.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let num_cols = headers.len();
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < num_cols {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let render_row = |cells: Vec<&str>| -> String {
        cells
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:<width$}", cell, width = w)
            })
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = vec![render_row(headers.to_vec())];
    out.extend(
        rows.iter()
            .map(|row| render_row(row.iter().map(String::as_str).collect())),
    );
    out.join("\n")
}

/// Print rows as a column-aligned table with headers.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    println!("{}", render_table(headers, rows));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ages_pick_the_largest_unit() {
        let now = Utc::now();
        assert_eq!(format_age_at(&(now - Duration::days(3)), &now), "3d");
        assert_eq!(format_age_at(&(now - Duration::hours(5)), &now), "5h");
        assert_eq!(format_age_at(&(now - Duration::minutes(30)), &now), "30m");
        assert_eq!(format_age_at(&(now - Duration::seconds(15)), &now), "15s");
    }

    #[test]
    fn future_timestamps_clamp_to_zero() {
        let now = Utc::now();
        assert_eq!(format_age_at(&(now + Duration::hours(1)), &now), "0s");
    }

    #[test]
    fn columns_align_to_widest_cell() {
        let table = render_table(
            &["NODE", "READY"],
            &[
                vec!["controller-0".to_string(), "True".to_string()],
                vec!["w-1".to_string(), "False".to_string()],
            ],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "NODE          READY");
        assert_eq!(lines[1], "controller-0  True");
        assert_eq!(lines[2], "w-1           False");
    }

    #[test]
    fn headers_only_when_no_rows() {
        assert_eq!(render_table(&["NAME", "STATUS"], &[]), "NAME  STATUS");
    }
}
