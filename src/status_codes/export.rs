//! Markdown rendering of the mapping table, published as living documentation of the
//! internal code space.

use super::StatusCodeMapping;
use chrono::{DateTime, Utc};

const HEADER: &str = "| internal_code | external_system | external_code | status_message | is_success |";
const ALIGNMENT: &str = "| ---: | --- | --- | --- | :---: |";
const EMPTY_ROW: &str = "| _(none yet)_ |  |  |  |  |";
const VARIES: &str = "_(varies; from upstream)_";

const INTRO: &str = "This file documents the internal gateway status codes exposed by this service. \
Internal codes start from 0 and map to external systems (e.g., Safaricom/Daraja).";

const NOTES: &str = "Notes:\n\n\
- `status_code` / `status_message` are returned to integrators.\n\
- `status_message` typically comes from the stored `default_message` below \
(or the upstream message when no default is stored).";

/// Render rows (sorted here by `internal_code`) as a Markdown document
pub fn render_markdown(rows: &[StatusCodeMapping], generated_at: DateTime<Utc>) -> String {
    let mut sorted: Vec<&StatusCodeMapping> = rows.iter().collect();
    sorted.sort_by_key(|r| r.internal_code);

    let mut out = format!(
        "# Status Codes\n\n{}\n\nLast generated: {}\n\n{}\n\n{}\n{}\n",
        INTRO,
        generated_at.format("%Y-%m-%d %H:%M:%SZ"),
        NOTES,
        HEADER,
        ALIGNMENT
    );

    if sorted.is_empty() {
        out.push_str(EMPTY_ROW);
        out.push('\n');
        return out;
    }

    for row in sorted {
        out.push_str(&table_row(row));
        out.push('\n');
    }
    out
}

fn table_row(row: &StatusCodeMapping) -> String {
    let message = row.default_message.trim();
    let message = if message.is_empty() {
        VARIES.to_string()
    } else {
        escape_cell(message)
    };

    format!(
        "| {} | {} | {} | {} | {} |",
        row.internal_code,
        escape_cell(row.external_system.as_str()),
        escape_cell(&row.external_code),
        message,
        if row.is_success { "yes" } else { "no" }
    )
}

fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_codes::ExternalSystem;
    use chrono::TimeZone;

    fn row(system: ExternalSystem, code: &str, internal: i64, msg: &str) -> StatusCodeMapping {
        StatusCodeMapping {
            external_system: system,
            external_code: code.to_string(),
            internal_code: internal,
            default_message: msg.to_string(),
            is_success: internal == 0,
        }
    }

    fn generated_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn empty_table_renders_placeholder_row() {
        let doc = render_markdown(&[], generated_at());
        assert!(doc.contains(HEADER));
        assert!(doc.contains(ALIGNMENT));
        assert!(doc.ends_with("| _(none yet)_ |  |  |  |  |\n"));
        assert!(doc.contains("Last generated: 2024-05-01 12:30:00Z"));
        assert!(doc.starts_with("# Status Codes\n\nThis file documents"));
        assert!(doc.contains("Notes:\n\n- `status_code` / `status_message` are returned to integrators.\n"));
        assert!(doc.contains("when no default is stored).\n\n| internal_code"));
    }

    #[test]
    fn rows_are_sorted_and_escaped() {
        let rows = vec![
            row(ExternalSystem::Gateway, "HTTP_502", 2, ""),
            row(ExternalSystem::Safaricom, "0", 0, "Success"),
            row(ExternalSystem::Safaricom, "1032", 1, "Cancelled | by user\nretry"),
        ];

        let doc = render_markdown(&rows, generated_at());
        let lines: Vec<&str> = doc.lines().filter(|l| l.starts_with("| ")).collect();

        assert_eq!(lines[0], HEADER);
        assert_eq!(lines[1], ALIGNMENT);
        assert_eq!(lines[2], "| 0 | safaricom | 0 | Success | yes |");
        assert_eq!(
            lines[3],
            "| 1 | safaricom | 1032 | Cancelled \\| by user retry | no |"
        );
        assert_eq!(
            lines[4],
            "| 2 | gateway | HTTP_502 | _(varies; from upstream)_ | no |"
        );
    }
}
