use std::fmt::Write;

use bytesize::ByteSize;

use super::{AggregatedView, RelayFigures, RowData};
use crate::relay::RATE_LABELS;

/// Columns after the relay URL (sessions, connections, bytes, six rates, provided-by).
const DATA_COLUMNS: usize = 3 + RATE_LABELS.len() + 1;

const HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Relay Status</title>
<style>
table {
    border-collapse: collapse;
}

table, th, td {
   border: 1px solid black;
}

tr.totals {
    font-weight: bold;
}
</style>
</head>
<body>
"#;

const TAIL: &str = "</table>\n</body>\n</html>\n";

/// Render the view as an HTML table with a trailing totals row.
pub fn render_page(view: &AggregatedView) -> String {
    let mut out = String::with_capacity(1024 + view.relays.len() * 256);
    out.push_str(HEAD);

    match &view.snapshot {
        Some(key) => {
            let _ = writeln!(out, "<p>Snapshot {}</p>", escape(key));
        }
        None => out.push_str("<p>No data collected yet.</p>\n"),
    }

    out.push_str("<table>\n<tr><th>Relay URL</th><th>Sessions</th><th>Connections</th><th>Bytes Proxied</th>");
    for label in RATE_LABELS {
        let _ = write!(out, "<th>{label}</th>");
    }
    out.push_str("<th>Provided by</th></tr>\n");

    for row in &view.relays {
        let _ = write!(out, "<tr><td>{}</td>", escape(&row.relay));
        match &row.data {
            RowData::Stats(figures) => write_figures(&mut out, figures),
            RowData::Error(message) => {
                let _ = write!(
                    out,
                    "<td colspan=\"{DATA_COLUMNS}\">{}</td>",
                    escape(message)
                );
            }
        }
        out.push_str("</tr>\n");
    }

    out.push_str("<tr class=\"totals\"><td>Totals</td>");
    write_figures(&mut out, &view.totals);
    out.push_str("</tr>\n");

    out.push_str(TAIL);
    out
}

fn write_figures(out: &mut String, figures: &RelayFigures) {
    let _ = write!(
        out,
        "<td>{}</td><td>{}</td><td>{}</td>",
        figures.num_active_sessions,
        figures.num_connections,
        format_bytes(figures.bytes_proxied),
    );
    for rate in figures.rates {
        let _ = write!(out, "<td>{rate}</td>");
    }
    let _ = write!(out, "<td>{}</td>", escape(&figures.provided_by));
}

/// Binary-unit byte count, e.g. "1.5 GiB".
pub fn format_bytes(bytes: u64) -> String {
    ByteSize::b(bytes).to_string_as(true)
}

/// Minimal HTML escaping for text content and attribute values.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
