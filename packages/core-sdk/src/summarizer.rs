//! Local, network-free reply built from the hub's own data.

use time::{macros::format_description, Date};
use tracing::warn;

use crate::models::{Source, SourceKind};
use crate::workspace::Workspace;

/** \brief Reply when nothing matched and nothing needs attention. */
pub const STANDING_BY: &str =
    "MONKY local assistant standing by. Nothing in your projects, tasks, notes, bills or sensors matches that right now.";

/** \brief Bills due within this many days are always mentioned. */
pub const BILL_WINDOW_DAYS: i64 = 7;

const NOMINAL_SENSOR_STATES: &[&str] = &["ok", "nominal", "normal", "online", "green"];
const CLOSED_STATES: &[&str] = &["done", "complete", "completed", "closed", "cancelled", "archived"];

/**
 * \brief Reply text plus the records that informed it.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct LocalReply {
    pub text: String,
    pub sources: Vec<Source>,
}

/**
 * \brief Lowercase words longer than three characters, in first-seen order.
 */
pub fn keywords(message: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in message
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 3)
    {
        if !out.contains(&word) {
            out.push(word);
        }
    }
    out
}

fn mentions(text: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return false;
    }
    let haystack = text.to_lowercase();
    keywords.iter().any(|k| haystack.contains(k.as_str()))
}

fn parse_date(raw: Option<&str>) -> Option<Date> {
    let raw = raw?.trim();
    let day = raw.get(..10).unwrap_or(raw);
    Date::parse(day, format_description!("[year]-[month]-[day]")).ok()
}

fn is_closed(status: &str) -> bool {
    CLOSED_STATES.contains(&status.trim().to_lowercase().as_str())
}

/** \brief Collection errors degrade to "no rows" so the fallback always answers. */
fn rows<T>(what: &str, result: anyhow::Result<Vec<T>>) -> Vec<T> {
    result.unwrap_or_else(|err| {
        warn!(collection = what, error = %err, "workspace read failed");
        Vec::new()
    })
}

/**
 * \brief Builds the local reply for `message` against `workspace` as of `today`.
 */
pub fn summarize(message: &str, workspace: &dyn Workspace, today: Date) -> LocalReply {
    let keys = keywords(message);
    let mut lines: Vec<String> = Vec::new();
    let mut sources: Vec<Source> = Vec::new();

    let projects = rows("projects", workspace.projects());
    let active: Vec<_> = projects.iter().filter(|p| !is_closed(&p.status)).collect();
    if !active.is_empty() {
        let next = active
            .iter()
            .filter_map(|p| parse_date(p.due_date.as_deref()).map(|d| (d, p.name.as_str())))
            .min();
        match next {
            Some((due, name)) => lines.push(format!(
                "{} active project(s); next due: {} on {}.",
                active.len(),
                name,
                due
            )),
            None => lines.push(format!("{} active project(s).", active.len())),
        }
    }
    for p in projects.iter().filter(|p| mentions(&p.name, &keys)) {
        let due = p.due_date.as_deref().unwrap_or("no due date");
        sources.push(Source::new(
            SourceKind::Project,
            &p.name,
            format!("status {}, due {}", p.status, due),
        ));
    }

    let tasks = rows("tasks", workspace.tasks());
    let open: Vec<_> = tasks.iter().filter(|t| !is_closed(&t.status)).collect();
    if !open.is_empty() {
        let overdue = open
            .iter()
            .filter(|t| parse_date(t.due_date.as_deref()).is_some_and(|d| d < today))
            .count();
        if overdue > 0 {
            lines.push(format!("{} open task(s), {} overdue.", open.len(), overdue));
        } else {
            lines.push(format!("{} open task(s).", open.len()));
        }
    }
    for t in tasks
        .iter()
        .filter(|t| mentions(&format!("{} {}", t.title, t.description), &keys))
    {
        let detail = match t.due_date.as_deref() {
            Some(due) => format!("[{}] due {}: {}", t.status, due, t.description),
            None => format!("[{}] {}", t.status, t.description),
        };
        sources.push(Source::new(SourceKind::Task, &t.title, detail));
    }

    for n in rows("notes", workspace.notes())
        .iter()
        .filter(|n| mentions(&format!("{} {}", n.title, n.content), &keys))
    {
        sources.push(Source::new(SourceKind::Note, &n.title, &n.content));
    }

    let bills = rows("bills", workspace.bills());
    let due_soon: Vec<_> = bills
        .iter()
        .filter(|b| !b.status.trim().eq_ignore_ascii_case("paid"))
        .filter_map(|b| parse_date(b.due_date.as_deref()).map(|d| (b, d)))
        .filter(|(_, d)| {
            let days = (*d - today).whole_days();
            (0..=BILL_WINDOW_DAYS).contains(&days)
        })
        .collect();
    if !due_soon.is_empty() {
        let total: f64 = due_soon.iter().map(|(b, _)| b.amount).sum();
        let names = due_soon
            .iter()
            .map(|(b, d)| format!("{} ({})", b.name, d))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!(
            "{} bill(s) due within {} days totalling {:.2}: {}.",
            due_soon.len(),
            BILL_WINDOW_DAYS,
            total,
            names
        ));
    }
    for b in bills.iter().filter(|b| mentions(&b.name, &keys)) {
        let due = b.due_date.as_deref().unwrap_or("no due date");
        sources.push(Source::new(
            SourceKind::Bill,
            &b.name,
            format!("{:.2} due {} ({})", b.amount, due, b.status),
        ));
    }

    let sensors = rows("sensors", workspace.sensors());
    let alerts: Vec<_> = sensors
        .iter()
        .filter(|s| !NOMINAL_SENSOR_STATES.contains(&s.status.trim().to_lowercase().as_str()))
        .collect();
    if !alerts.is_empty() {
        let names = alerts
            .iter()
            .map(|s| format!("{} ({})", s.name, s.status))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("Sensors needing attention: {}.", names));
    }
    for s in sensors
        .iter()
        .filter(|s| mentions(&format!("{} {}", s.name, s.location), &keys))
    {
        let reading = s
            .last_value
            .map(|v| format!("{} {}", v, s.unit).trim().to_string())
            .unwrap_or_else(|| "no reading".to_string());
        sources.push(Source::new(
            SourceKind::Sensor,
            &s.name,
            format!("{} at {}, {}", reading, s.location, s.status),
        ));
    }

    for k in rows("kpis", workspace.kpis())
        .iter()
        .filter(|k| mentions(&format!("{} {}", k.dataset, k.label), &keys))
    {
        sources.push(Source::new(
            SourceKind::Kpi,
            format!("{} / {}", k.dataset, k.label),
            format!("{} {}", k.value, k.unit),
        ));
    }

    for hit in rows("documents", workspace.search(&keys)) {
        sources.push(Source::new(SourceKind::Doc, &hit.title, &hit.excerpt));
    }

    if lines.is_empty() && sources.is_empty() {
        return LocalReply {
            text: STANDING_BY.to_string(),
            sources,
        };
    }

    let mut text = String::from("Here is what I can see locally:");
    for line in &lines {
        text.push_str("\n- ");
        text.push_str(line);
    }
    if !sources.is_empty() {
        text.push_str(&format!(
            "\n{} matching record(s) for your question are listed as sources.",
            sources.len()
        ));
    }
    LocalReply { text, sources }
}
