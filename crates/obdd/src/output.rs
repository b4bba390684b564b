//! Output formatting for the obdd CLI (text tables or JSON)

use clap::ValueEnum;
use colored::{ColoredString, Colorize};
use obd_core::{
    ClearOutcome, DiagnosticSession, EndpointDescriptor, SensorReading, Severity, TroubleCode,
};
use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables (default)
    #[default]
    Text,
    /// JSON documents
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    pub fn is_text(&self) -> bool {
        self.format == OutputFormat::Text
    }

    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
        );
    }

    fn table<T: Tabled>(&self, rows: &[T]) {
        if rows.is_empty() {
            if !self.quiet {
                println!("None");
            }
        } else {
            println!("{}", Table::new(rows));
        }
    }

    fn heading(&self, title: &str) {
        if !self.quiet {
            println!("\n{}", title.bold());
        }
    }
}

fn severity_label(severity: Severity) -> ColoredString {
    let label = severity.as_str().to_uppercase();
    match severity {
        Severity::Critical => label.red().bold(),
        Severity::High => label.red(),
        Severity::Medium => label.yellow(),
        Severity::Low | Severity::None => label.green(),
    }
}

#[derive(Debug, Tabled, Serialize)]
struct PortRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Label")]
    label: String,
    #[tabled(rename = "Manufacturer")]
    manufacturer: String,
    #[tabled(rename = "Last Seen")]
    last_seen: String,
}

#[derive(Debug, Tabled)]
struct CodeRow {
    #[tabled(rename = "Code")]
    code: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Description")]
    description: String,
}

impl From<&TroubleCode> for CodeRow {
    fn from(code: &TroubleCode) -> Self {
        Self {
            code: code.code.clone(),
            kind: format!("{:?}", code.kind).to_lowercase(),
            severity: severity_label(code.severity).to_string(),
            description: code.description.clone(),
        }
    }
}

#[derive(Debug, Tabled)]
struct SensorRow {
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "Sensor")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Unit")]
    unit: String,
    #[tabled(rename = "Trend")]
    trend: String,
}

impl From<&SensorReading> for SensorRow {
    fn from(reading: &SensorReading) -> Self {
        Self {
            pid: format!("{:02X}", reading.pid),
            name: reading.name.clone(),
            value: format!("{:.1}", reading.value),
            unit: reading.unit.clone(),
            trend: format!("{:?}", reading.trend).to_lowercase(),
        }
    }
}

#[derive(Debug, Tabled)]
struct DiagnosisRow {
    #[tabled(rename = "Diagnosis")]
    name: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Codes")]
    codes: String,
}

#[derive(Debug, Tabled)]
struct RepairRow {
    #[tabled(rename = "Repair")]
    name: String,
    #[tabled(rename = "For")]
    issue: String,
    #[tabled(rename = "Difficulty")]
    difficulty: String,
    #[tabled(rename = "Cost")]
    cost: String,
}

#[derive(Debug, Tabled)]
struct HistoryRow {
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Codes")]
    codes: usize,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Session")]
    id: String,
}

pub fn print_ports(ctx: &OutputContext, ports: &[EndpointDescriptor]) {
    let rows: Vec<PortRow> = ports
        .iter()
        .map(|p| PortRow {
            address: p.address.clone(),
            kind: p.kind.to_string(),
            label: p.label.clone(),
            manufacturer: p.manufacturer.clone().unwrap_or_else(|| "-".to_string()),
            last_seen: p
                .last_seen
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    if !ctx.is_text() {
        ctx.json(&rows);
        return;
    }
    if rows.is_empty() {
        ctx.info("No diagnostic adapters found");
        return;
    }
    ctx.table(&rows);
}

pub fn print_session(ctx: &OutputContext, session: &DiagnosticSession) {
    if !ctx.is_text() {
        ctx.json(session);
        return;
    }

    println!("{} {}", "Vehicle:".bold(), session.vehicle.display_name());
    if let Some(vin) = &session.vehicle_info.vin {
        println!("{} {}", "VIN:".bold(), vin);
    }
    if let Some(endpoint) = &session.endpoint {
        println!("{} {}", "Adapter:".bold(), endpoint);
    }
    println!("{} {}", "Protocol:".bold(), session.protocol);
    if session.simulated {
        println!("{}", "Simulation mode".dimmed());
    }

    if !session.success {
        ctx.error(&format!(
            "Trouble codes could not be read: {}",
            session.error.as_deref().unwrap_or("unknown error")
        ));
        return;
    }

    ctx.heading("Trouble codes");
    let codes: Vec<CodeRow> = session.trouble_codes.iter().map(CodeRow::from).collect();
    ctx.table(&codes);

    if let Some(analysis) = &session.analysis {
        println!(
            "\n{} {}",
            "Overall severity:".bold(),
            severity_label(session.severity())
        );

        if !analysis.safety_warnings.is_empty() {
            ctx.heading("Safety warnings");
            for warning in &analysis.safety_warnings {
                println!("  {} {}", "!".red().bold(), warning.text);
            }
        }

        if !analysis.diagnoses.is_empty() {
            ctx.heading("Diagnoses");
            let rows: Vec<DiagnosisRow> = analysis
                .diagnoses
                .iter()
                .map(|d| DiagnosisRow {
                    name: d.name.clone(),
                    severity: severity_label(d.severity).to_string(),
                    confidence: format!("{:.0}%", d.confidence * 100.0),
                    codes: d.codes.join(", "),
                })
                .collect();
            ctx.table(&rows);
        }

        for (title, repairs) in [
            ("DIY repairs", &analysis.diy_repairs),
            ("Professional repairs", &analysis.professional_repairs),
        ] {
            if repairs.is_empty() {
                continue;
            }
            ctx.heading(title);
            let rows: Vec<RepairRow> = repairs
                .iter()
                .map(|r| RepairRow {
                    name: r.repair_name.clone(),
                    issue: r.issue_name.clone(),
                    difficulty: r
                        .difficulty
                        .map(|d| format!("{}/5", d))
                        .unwrap_or_else(|| "-".to_string()),
                    cost: r.estimated_cost.clone().unwrap_or_else(|| "-".to_string()),
                })
                .collect();
            ctx.table(&rows);
        }

        if !analysis.observations.is_empty() {
            ctx.heading("Sensor observations");
            for observation in &analysis.observations {
                println!(
                    "  [{}] {}",
                    severity_label(observation.severity),
                    observation.message
                );
            }
        }

        ctx.heading("Summary");
        println!("{}", analysis.summary);
        if let Some(provider) = &analysis.enriched_by {
            println!("{}", format!("Enriched by {}", provider).dimmed());
        }
    }

    if !session.sensor_readings.is_empty() {
        ctx.heading("Live data");
        print_sensor_table(ctx, &session.sensor_readings);
    }
}

fn print_sensor_table(ctx: &OutputContext, readings: &[SensorReading]) {
    let rows: Vec<SensorRow> = readings.iter().map(SensorRow::from).collect();
    ctx.table(&rows);
}

pub fn print_sensors(ctx: &OutputContext, readings: &[SensorReading]) {
    if ctx.is_text() {
        print_sensor_table(ctx, readings);
    } else {
        ctx.json(readings);
    }
}

pub fn print_clear(ctx: &OutputContext, outcome: &ClearOutcome) {
    if !ctx.is_text() {
        ctx.json(outcome);
        return;
    }
    match outcome {
        ClearOutcome::Cleared => ctx.success("Trouble codes cleared"),
        ClearOutcome::VerificationFailed { remaining } => ctx.warn(&format!(
            "Clear command accepted but codes are still active: {}",
            remaining.join(", ")
        )),
        ClearOutcome::Unverified { reason } => ctx.warn(&format!(
            "Clear command accepted but the codes could not be re-read: {}",
            reason
        )),
    }
}

pub fn print_history(ctx: &OutputContext, sessions: &[DiagnosticSession]) {
    if !ctx.is_text() {
        ctx.json(sessions);
        return;
    }
    if sessions.is_empty() {
        ctx.info("No saved sessions");
        return;
    }
    let rows: Vec<HistoryRow> = sessions
        .iter()
        .map(|s| HistoryRow {
            started: s.started_at.format("%Y-%m-%d %H:%M").to_string(),
            codes: s.trouble_codes.len(),
            severity: severity_label(s.severity()).to_string(),
            result: if s.success {
                "ok".to_string()
            } else {
                s.error.clone().unwrap_or_else(|| "failed".to_string())
            },
            id: s.id.to_string(),
        })
        .collect();
    ctx.table(&rows);
}
