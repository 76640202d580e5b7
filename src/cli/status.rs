use anyhow::Result;
use chrono::{DateTime, Utc};
use oncall_watch::cache::{EntrySummary, MonitorStatus};
use oncall_watch::core::settings::Settings;
use oncall_watch::pagerduty::{PagerDutyApi, PagerDutyClient, SOURCE_NAME};
use serde::Serialize;
use std::time::Instant;

#[derive(Serialize)]
struct StatusOutput {
    source: &'static str,
    status: MonitorStatus,
    entries: Vec<EntrySummary>,
    on_call: Vec<OnCallLine>,
    open_incidents: usize,
    #[serde(with = "chrono::serde::ts_seconds")]
    fetched_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct OnCallLine {
    escalation_level: u32,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ends_in: Option<String>,
}

pub async fn run(settings: Settings, json: bool, require_data: bool) -> Result<()> {
    let client = PagerDutyClient::new(&settings.pagerduty)?;
    let api = PagerDutyApi::new(client, &settings.polling)?;

    api.refresh_all(Instant::now())?.wait().await;

    let output = build_output(&api, require_data, Utc::now());

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_text_output(&output);
    }

    Ok(())
}

fn build_output(api: &PagerDutyApi, require_data: bool, now: DateTime<Utc>) -> StatusOutput {
    let on_call = api
        .on_call_schedule()
        .into_iter()
        .map(|slot| {
            let name = slot
                .user
                .as_ref()
                .map(|user| {
                    api.get_person(&user.id)
                        .map(|person| person.name)
                        .or_else(|| user.summary.clone())
                        .unwrap_or_else(|| user.id.clone())
                })
                .unwrap_or_else(|| "(nobody)".to_string());
            let schedule = slot.schedule.as_ref().map(|schedule| {
                api.get_schedule(&schedule.id)
                    .map(|s| s.display_name().to_string())
                    .or_else(|| schedule.summary.clone())
                    .unwrap_or_else(|| schedule.id.clone())
            });

            OnCallLine {
                escalation_level: slot.escalation_level,
                name,
                schedule,
                ends_in: slot.end.map(|end| format_remaining(end, now)),
            }
        })
        .collect();

    StatusOutput {
        source: SOURCE_NAME,
        status: api.monitor_status(require_data),
        entries: api.summaries(),
        on_call,
        open_incidents: api.incidents().data().map_or(0, |i| i.len()),
        fetched_at: now,
    }
}

fn format_remaining(until: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let duration = until.signed_duration_since(now);

    if duration.num_seconds() <= 0 {
        return "now".to_string();
    }

    let total_minutes = duration.num_minutes();
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes % (24 * 60)) / 60;
    let minutes = total_minutes % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

fn print_text_output(output: &StatusOutput) {
    println!("{}: {}", output.source, output.status);

    for entry in &output.entries {
        let state = match (&entry.error, entry.present) {
            (Some(error), true) => format!("stale ({})", error),
            (Some(error), false) => format!("Error: {}", error),
            (None, true) => "ok".to_string(),
            (None, false) => "no data".to_string(),
        };
        println!("  {:<28} {}", entry.key, state);
    }

    if !output.on_call.is_empty() {
        println!();
        println!("On call");
        for line in &output.on_call {
            let ends = line
                .ends_in
                .as_ref()
                .map(|e| format!(" (ends in {})", e))
                .unwrap_or_default();
            let schedule = line
                .schedule
                .as_ref()
                .map(|s| format!(" [{}]", s))
                .unwrap_or_default();
            println!(
                "  L{:<3} {}{}{}",
                line.escalation_level, line.name, schedule, ends
            );
        }
    }

    println!();
    println!("Open incidents: {}", output.open_incidents);
}
