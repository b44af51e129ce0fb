//! Server-rendered tables for the issue and event browsers.

use chrono::{TimeZone, Utc};
use farmwatch_core::{OpsEvent, WorkItem};
use farmwatch_store::EventQuery;
use std::fmt::Write;

const PAGE_STYLE: &str = "body{font-family:monospace;margin:1.5em}\
table{border-collapse:collapse}td,th{border:1px solid #ccc;padding:2px 6px;text-align:left}\
tr.diagnostic{background:#fde2e2}form input{margin-right:.5em}";

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// `YYYY-MM-DD HH:MM:SS UTC`, or the raw number when out of range.
pub fn format_ts_ms(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => ts_ms.to_string(),
    }
}

fn format_epoch_seconds(seconds: f64) -> String {
    if seconds <= 0.0 {
        return String::new();
    }
    format_ts_ms((seconds * 1000.0) as i64)
}

fn page_open(out: &mut String, title: &str) {
    let _ = write!(
        out,
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>{}</title><style>{PAGE_STYLE}</style></head><body>\n",
        escape_html(title)
    );
}

pub fn render_issues_page(root_label: &str, items: &[WorkItem]) -> String {
    let mut out = String::new();
    page_open(&mut out, "farmwatch issues");
    let _ = writeln!(
        out,
        "<h1>Issues ({})</h1>\n<p>root: <code>{}</code> &middot; <a href=\"/events\">events</a> &middot; <a href=\"/\">dashboard</a></p>",
        items.len(),
        escape_html(root_label)
    );
    out.push_str("<table>\n<tr><th>id</th><th>title</th><th>status</th><th>outcome</th><th>priority</th><th>tags</th><th>updated</th></tr>\n");
    for item in items {
        let outcome = item.outcome.as_ref().map(|o| o.as_str()).unwrap_or("");
        let _ = writeln!(
            out,
            "<tr data-id=\"{id}\"><td><a href=\"/events?issue_id={id}\">{id}</a></td><td>{title}</td><td>{status}</td><td>{outcome}</td><td>{priority}</td><td>{tags}</td><td title=\"{raw}\">{when}</td></tr>",
            id = escape_html(&item.id),
            title = escape_html(&item.title),
            status = escape_html(item.status.as_str()),
            outcome = escape_html(outcome),
            priority = item.priority,
            tags = escape_html(&item.tags.join(", ")),
            raw = item.touched_at(),
            when = format_epoch_seconds(item.touched_at()),
        );
    }
    out.push_str("</table>\n</body></html>\n");
    out
}

pub fn render_events_page(root_label: &str, query: &EventQuery, events: &[OpsEvent]) -> String {
    let mut out = String::new();
    page_open(&mut out, "farmwatch events");
    let _ = writeln!(
        out,
        "<h1>Events ({})</h1>\n<p>root: <code>{}</code> &middot; <a href=\"/issues\">issues</a> &middot; <a href=\"/\">dashboard</a></p>",
        events.len(),
        escape_html(root_label)
    );

    let echo = |value: &Option<String>| escape_html(value.as_deref().unwrap_or(""));
    let _ = writeln!(
        out,
        "<form method=\"get\" action=\"/events\">\
<label>issue_id <input name=\"issue_id\" value=\"{}\"></label>\
<label>run_id <input name=\"run_id\" value=\"{}\"></label>\
<label>type <input name=\"type\" value=\"{}\"></label>\
<label>limit <input name=\"limit\" value=\"{}\"></label>\
<button type=\"submit\">filter</button></form>",
        echo(&query.issue_id),
        echo(&query.run_id),
        echo(&query.event_type),
        query.limit
    );

    out.push_str("<table>\n<tr><th>time</th><th>type</th><th>source</th><th>issue</th><th>run</th><th>payload</th></tr>\n");
    for event in events {
        let payload = serde_json::to_string(&event.payload).unwrap_or_default();
        let issue = event.issue_id.as_deref().unwrap_or("");
        let run = event.run_id.as_deref().unwrap_or("");
        let class = if event.is_diagnostic() {
            " class=\"diagnostic\""
        } else {
            ""
        };
        let _ = write!(
            out,
            "<tr{class}><td title=\"{raw}\">{when}</td><td>{kind}</td><td>{source}</td><td>{issue}</td><td>{run}</td><td><code>{payload}</code>",
            raw = event.ts_ms,
            when = format_ts_ms(event.ts_ms),
            kind = escape_html(&event.event_type),
            source = escape_html(&event.source),
            issue = escape_html(issue),
            run = escape_html(run),
            payload = escape_html(&payload),
        );
        if let Some(diagnostic) = &event.diagnostic {
            let _ = write!(out, "<br><em>{}</em>", escape_html(diagnostic));
        }
        out.push_str("</td></tr>\n");
    }
    out.push_str("</table>\n</body></html>\n");
    out
}
