//! Run report delivery: HTML summary, spreadsheet attachment and SMTP dispatch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use icms_core::{ExecutionMode, RunSummary};
use icms_sync::{timezone_from_env, ReportNotifier, DEFAULT_SCHEDULE};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_xlsxwriter::Workbook;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "icms-report";

pub const DEFAULT_RECIPIENT: &str = "icms-monitor@example.com";
pub const DEFAULT_SENDER: &str = "no-reply@example.com";
const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid"));

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("building report spreadsheet: {0}")]
    Spreadsheet(#[from] rust_xlsxwriter::XlsxError),
    #[error("rendering report body: {0}")]
    Template(#[from] askama::Error),
    #[error("building email message: {0}")]
    Message(String),
    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("report file io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub recipients: Vec<String>,
    pub schedule: String,
    pub timezone: Tz,
    pub temp_dir: PathBuf,
    pub mail: MailConfig,
}

impl ReportConfig {
    pub fn from_env() -> Self {
        let username = std::env::var("MAIL_USERNAME").ok().filter(|v| !v.trim().is_empty());
        let from = std::env::var("MAIL_FROM")
            .ok()
            .or_else(|| username.clone())
            .unwrap_or_else(|| DEFAULT_SENDER.to_string());
        Self {
            recipients: resolve_recipients(std::env::var("NOTIFICATION_EMAIL").ok().as_deref()),
            schedule: std::env::var("SCHEDULE_ICMS").unwrap_or_else(|_| DEFAULT_SCHEDULE.to_string()),
            timezone: timezone_from_env(),
            temp_dir: std::env::var("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./temp")),
            mail: MailConfig {
                host: std::env::var("MAIL_HOST").unwrap_or_else(|_| "smtp.office365.com".to_string()),
                port: std::env::var("MAIL_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(587),
                username,
                password: std::env::var("MAIL_PASSWORD").ok(),
                from,
                timeout_secs: std::env::var("MAIL_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            },
        }
    }
}

pub fn is_valid_email(address: &str) -> bool {
    EMAIL_PATTERN.is_match(address)
}

/// Splits a comma-separated recipient list, keeping well-formed addresses.
/// Falls back to [`DEFAULT_RECIPIENT`] when nothing usable remains.
pub fn resolve_recipients(raw: Option<&str>) -> Vec<String> {
    let recipients: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|address| !address.is_empty() && is_valid_email(address))
        .map(str::to_string)
        .collect();

    if recipients.is_empty() {
        info!(fallback = DEFAULT_RECIPIENT, "no valid NOTIFICATION_EMAIL; using fallback recipient");
        return vec![DEFAULT_RECIPIENT.to_string()];
    }
    recipients
}

/// Estimated next scheduled execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextRun {
    pub at: NaiveDateTime,
    pub days_until: i64,
}

impl NextRun {
    pub fn label(&self) -> String {
        match self.days_until {
            0 => "hoje".to_string(),
            1 => "amanhã".to_string(),
            n => format!("{n} dias"),
        }
    }

    pub fn formatted(&self) -> String {
        self.at.format("%d/%m/%Y às %H:%M").to_string()
    }
}

fn at_day_clamped(year: i32, month: u32, day: u32, time: NaiveTime) -> Option<NaiveDateTime> {
    (1..=day.clamp(1, 31))
        .rev()
        .find_map(|d| NaiveDate::from_ymd_opt(year, month, d))
        .map(|date| date.and_time(time))
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Estimates the next run of `schedule` after `now`.
///
/// Accepts five or six field cron expressions. A fixed day of month with any
/// month resolves to that day this month or next; everything else resolves to
/// the 1st of next month. Days past the end of a month clamp to its last day.
pub fn estimate_next_run(schedule: &str, now: NaiveDateTime) -> NextRun {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    let offset = usize::from(fields.len() >= 6);
    let field = |i: usize| fields.get(i + offset).copied().unwrap_or("*");

    let minute: u32 = field(0).parse().ok().filter(|m| *m < 60).unwrap_or(0);
    let hour: u32 = field(1).parse().ok().filter(|h| *h < 24).unwrap_or(2);
    let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);

    let fixed_day = match (field(2), field(3)) {
        (day, "*") if day != "*" => day.parse::<u32>().ok().filter(|d| (1..=31).contains(d)),
        _ => None,
    };

    let (next_year, next_month) = next_month(now.year(), now.month());
    let at = match fixed_day {
        Some(day) => at_day_clamped(now.year(), now.month(), day, time)
            .filter(|candidate| *candidate >= now)
            .or_else(|| at_day_clamped(next_year, next_month, day, time)),
        None => at_day_clamped(next_year, next_month, 1, time),
    }
    .unwrap_or(now);

    NextRun {
        at,
        days_until: (at.date() - now.date()).num_days(),
    }
}

pub fn status_class(success_rate: u32) -> &'static str {
    if success_rate >= 90 {
        "success"
    } else if success_rate >= 70 {
        "warning"
    } else {
        "error"
    }
}

pub fn report_subject(mode: ExecutionMode, date: NaiveDate) -> String {
    format!(
        "{} Relatório ICMS {} - {}",
        mode.icon(),
        mode.label(),
        date.format("%d/%m/%Y")
    )
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate<'a> {
    executed_at: String,
    mode: &'a str,
    method: &'a str,
    period_start: &'a str,
    period_end: &'a str,
    elapsed_minutes: u64,
    elapsed_secs: u64,
    regions: String,
    total_records: usize,
    successes: usize,
    failures: usize,
    success_rate: u32,
    status_class: &'static str,
    next_run: String,
    next_run_label: String,
    load_error: Option<&'a str>,
}

pub fn render_report_body(
    summary: &RunSummary,
    mode: ExecutionMode,
    executed_at: NaiveDateTime,
    next_run: NextRun,
) -> Result<String, ReportError> {
    let success_rate = summary.success_rate_percent();
    let template = ReportTemplate {
        executed_at: executed_at.format("%d/%m/%Y %H:%M").to_string(),
        mode: mode.label(),
        method: summary.processing_method.label(),
        period_start: &summary.period_start,
        period_end: &summary.period_end,
        elapsed_minutes: summary.elapsed_minutes(),
        elapsed_secs: summary.elapsed_secs,
        regions: summary.regions().join(", "),
        total_records: summary.total_records,
        successes: summary.successes,
        failures: summary.failures,
        success_rate,
        status_class: status_class(success_rate),
        next_run: next_run.formatted(),
        next_run_label: next_run.label(),
        load_error: summary.load_error.as_deref(),
    };
    Ok(template.render()?)
}

pub fn report_file_name(date: NaiveDate) -> String {
    format!("relatorio_ICMS_{}.xlsx", date.format("%Y-%m-%d"))
}

/// Builds the `Detalhes` and `Resumo` sheets for `summary` as xlsx bytes.
pub fn report_workbook_bytes(summary: &RunSummary) -> Result<Vec<u8>, ReportError> {
    let mut workbook = Workbook::new();

    let details = workbook.add_worksheet();
    details.set_name("Detalhes")?;
    for (col, title) in ["Mês", "Ano", "Região", "Status"].into_iter().enumerate() {
        details.write_string(0, col as u16, title)?;
    }
    for (i, entry) in summary.ledger.entries().iter().enumerate() {
        let row = i as u32 + 1;
        details.write_string(row, 0, format!("{:02}", entry.month))?;
        details.write_number(row, 1, entry.year)?;
        details.write_string(row, 2, entry.region.as_str())?;
        details.write_string(row, 3, entry.status.label())?;
    }

    let overview = workbook.add_worksheet();
    overview.set_name("Resumo")?;
    let titles = [
        "Período Início",
        "Período Fim",
        "Tempo Execução (min)",
        "Total Registros",
        "Sucessos",
        "Falhas",
        "Taxa Sucesso (%)",
    ];
    for (col, title) in titles.into_iter().enumerate() {
        overview.write_string(0, col as u16, title)?;
    }
    overview.write_string(1, 0, summary.period_start.as_str())?;
    overview.write_string(1, 1, summary.period_end.as_str())?;
    overview.write_number(1, 2, summary.elapsed_minutes() as f64)?;
    overview.write_number(1, 3, summary.total_records as f64)?;
    overview.write_number(1, 4, summary.successes as f64)?;
    overview.write_number(1, 5, summary.failures as f64)?;
    overview.write_number(1, 6, summary.success_rate_percent())?;

    Ok(workbook.save_to_buffer()?)
}

#[derive(Debug, Clone)]
pub struct EmailAttachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
    pub attachment: Option<EmailAttachment>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), ReportError>;
}

#[derive(Debug, Default)]
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), ReportError> {
        info!(
            to = ?email.to,
            subject = %email.subject,
            attachment = email.attachment.as_ref().map(|a| a.filename.as_str()),
            "mail delivery disabled; report not sent"
        );
        Ok(())
    }
}

/// STARTTLS relay delivery through lettre.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> Result<Self, ReportError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));
        if let Some(username) = &config.username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            ));
        }
        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|err| ReportError::Message(format!("invalid sender {}: {err}", config.from)))?;
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

/// Assembles an HTML message with the optional spreadsheet attachment.
pub fn build_message(from: &Mailbox, email: &OutgoingEmail) -> Result<Message, ReportError> {
    let mut builder = Message::builder().from(from.clone()).subject(email.subject.clone());
    for address in &email.to {
        let mailbox = address
            .parse::<Mailbox>()
            .map_err(|err| ReportError::Message(format!("invalid recipient {address}: {err}")))?;
        builder = builder.to(mailbox);
    }

    let mut body = MultiPart::mixed().singlepart(SinglePart::html(email.html_body.clone()));
    if let Some(attachment) = &email.attachment {
        let content_type =
            ContentType::parse(XLSX_CONTENT_TYPE).map_err(|err| ReportError::Message(err.to_string()))?;
        body = body.singlepart(
            Attachment::new(attachment.filename.clone()).body(attachment.bytes.clone(), content_type),
        );
    }
    builder
        .multipart(body)
        .map_err(|err| ReportError::Message(err.to_string()))
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), ReportError> {
        let message = build_message(&self.from, email)?;
        let response = self.transport.send(message).await?;
        info!(
            to = ?email.to,
            code = %response.code(),
            "report email sent"
        );
        Ok(())
    }
}

/// Renders, attaches and mails the run report.
pub struct EmailReportNotifier {
    config: ReportConfig,
    mailer: Arc<dyn Mailer>,
}

impl EmailReportNotifier {
    pub fn new(config: ReportConfig, mailer: Arc<dyn Mailer>) -> Self {
        Self { config, mailer }
    }

    pub async fn send_report(
        &self,
        summary: &RunSummary,
        mode: ExecutionMode,
        now: DateTime<Utc>,
    ) -> Result<(), ReportError> {
        let local = now.with_timezone(&self.config.timezone).naive_local();
        let today = local.date();
        let next_run = estimate_next_run(&self.config.schedule, local);
        let html_body = render_report_body(summary, mode, local, next_run)?;

        tokio::fs::create_dir_all(&self.config.temp_dir).await?;
        let filename = report_file_name(today);
        let path = self.config.temp_dir.join(&filename);
        let bytes = report_workbook_bytes(summary)?;
        tokio::fs::write(&path, &bytes).await?;

        let email = OutgoingEmail {
            to: self.config.recipients.clone(),
            subject: report_subject(mode, today),
            html_body,
            attachment: Some(EmailAttachment { filename, bytes }),
        };
        self.mailer.send(&email).await?;

        if let Err(err) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %err, "could not remove temporary report");
        }
        Ok(())
    }
}

#[async_trait]
impl ReportNotifier for EmailReportNotifier {
    async fn notify(&self, summary: &RunSummary, mode: ExecutionMode) -> anyhow::Result<()> {
        self.send_report(summary, mode, Utc::now())
            .await
            .with_context(|| format!("delivering report for run {}", summary.run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{open_workbook_auto, Data, Reader};
    use icms_core::{IcmsRecord, Ledger, LoadStatus, ProcessingMethod};
    use icms_sync::DEFAULT_TIMEZONE;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").expect("datetime")
    }

    fn record(region: &str, month: i32) -> IcmsRecord {
        IcmsRecord {
            region_id: 1,
            region: region.to_string(),
            period: format!("2023{month:02}"),
            year: 2023,
            month,
            ..Default::default()
        }
    }

    fn summary() -> RunSummary {
        let records = vec![record("SP", 1), record("ES", 2), record("SP", 3), record("AC", 4)];
        let mut ledger = Ledger::new();
        ledger.record_batch(0, &records[..3], LoadStatus::Success);
        ledger.record_batch(3, &records[3..], LoadStatus::Failure);
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            processing_method: ProcessingMethod::Incremental,
            period_start: "01/2023".into(),
            period_end: "04/2023".into(),
            elapsed_secs: 150,
            total_records: 4,
            selected_records: 4,
            successes: 3,
            failures: 1,
            ledger,
            run_dir: String::new(),
            load_error: None,
        }
    }

    #[test]
    fn recipients_fall_back_when_invalid_or_absent() {
        assert_eq!(resolve_recipients(None), vec![DEFAULT_RECIPIENT]);
        assert_eq!(resolve_recipients(Some("  ")), vec![DEFAULT_RECIPIENT]);
        assert_eq!(resolve_recipients(Some("not-an-email, @x.com")), vec![DEFAULT_RECIPIENT]);
        assert_eq!(
            resolve_recipients(Some(" a@b.com ,bad, c.d@e.org")),
            vec!["a@b.com", "c.d@e.org"]
        );
    }

    #[test]
    fn email_shape_rule() {
        assert!(is_valid_email("ops@fazenda.gov.br"));
        assert!(!is_valid_email("ops@fazenda"));
        assert!(!is_valid_email("o ps@fazenda.gov.br"));
    }

    #[test]
    fn next_run_for_fixed_monthly_day() {
        let later_this_month = estimate_next_run("0 0 2 20 * *", at("2026-10-19 10:00"));
        assert_eq!(later_this_month.at, at("2026-10-20 02:00"));
        assert_eq!(later_this_month.days_until, 1);
        assert_eq!(later_this_month.label(), "amanhã");

        let already_passed = estimate_next_run("0 0 2 1 * *", at("2026-10-19 10:00"));
        assert_eq!(already_passed.at, at("2026-11-01 02:00"));
        assert_eq!(already_passed.days_until, 13);
        assert_eq!(already_passed.label(), "13 dias");

        let today = estimate_next_run("30 9 19 * *", at("2026-10-19 08:00"));
        assert_eq!(today.at, at("2026-10-19 09:30"));
        assert_eq!(today.label(), "hoje");
    }

    #[test]
    fn next_run_defaults_to_first_of_next_month() {
        let weekly = estimate_next_run("0 0 6 * * MON", at("2026-12-10 12:00"));
        assert_eq!(weekly.at, at("2027-01-01 06:00"));
        assert_eq!(weekly.formatted(), "01/01/2027 às 06:00");
    }

    #[test]
    fn next_run_clamps_short_months() {
        let next = estimate_next_run("0 0 3 31 * *", at("2026-11-02 00:00"));
        assert_eq!(next.at, at("2026-11-30 03:00"));
    }

    #[test]
    fn status_class_thresholds() {
        assert_eq!(status_class(100), "success");
        assert_eq!(status_class(90), "success");
        assert_eq!(status_class(89), "warning");
        assert_eq!(status_class(70), "warning");
        assert_eq!(status_class(69), "error");
        assert_eq!(status_class(0), "error");
    }

    #[test]
    fn subject_carries_mode_and_date() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        assert_eq!(report_subject(ExecutionMode::Scheduled, date), "⏰ Relatório ICMS Agendado - 01/03/2026");
        assert_eq!(report_subject(ExecutionMode::Forced, date), "🚀 Relatório ICMS Forçado - 01/03/2026");
    }

    #[test]
    fn body_lists_sorted_regions_and_rate() {
        let next = estimate_next_run(DEFAULT_SCHEDULE, at("2026-10-19 10:00"));
        let body = render_report_body(&summary(), ExecutionMode::Forced, at("2026-10-19 10:00"), next).expect("render");
        assert!(body.contains("AC, ES, SP"));
        assert!(body.contains("75%"));
        assert!(body.contains("stats warning"));
        assert!(body.contains("Forçado"));
        assert!(body.contains("às 02:00 (13 dias)"));
        assert!(body.contains("3 minutos (150 segundos)"));
    }

    #[test]
    fn workbook_has_detail_and_overview_sheets() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("report.xlsx");
        let bytes = report_workbook_bytes(&summary()).expect("build");
        std::fs::write(&path, bytes).expect("write");

        let mut workbook = open_workbook_auto(&path).expect("open");
        assert_eq!(workbook.sheet_names(), vec!["Detalhes".to_string(), "Resumo".to_string()]);

        let details = workbook.worksheet_range("Detalhes").expect("details");
        let rows: Vec<_> = details.rows().collect();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[1][0], Data::String("01".into()));
        assert_eq!(rows[4][3], Data::String("Falha".into()));

        let overview = workbook.worksheet_range("Resumo").expect("resumo");
        let rows: Vec<_> = overview.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][6], Data::Float(75.0));
    }

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<OutgoingEmail>>,
        fail: bool,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: &OutgoingEmail) -> Result<(), ReportError> {
            if self.fail {
                return Err(ReportError::Message("relay refused".into()));
            }
            self.sent.lock().expect("lock").push(email.clone());
            Ok(())
        }
    }

    fn config(temp_dir: &Path) -> ReportConfig {
        ReportConfig {
            recipients: vec!["ops@example.org".into()],
            schedule: DEFAULT_SCHEDULE.into(),
            timezone: DEFAULT_TIMEZONE,
            temp_dir: temp_dir.to_path_buf(),
            mail: MailConfig {
                host: "localhost".into(),
                port: 2525,
                username: None,
                password: None,
                from: DEFAULT_SENDER.into(),
                timeout_secs: 5,
            },
        }
    }

    #[tokio::test]
    async fn delivered_report_removes_temp_file() {
        let dir = tempdir().expect("tempdir");
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = EmailReportNotifier::new(config(dir.path()), mailer.clone());
        let now = DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        notifier
            .send_report(&summary(), ExecutionMode::Scheduled, now)
            .await
            .expect("send");

        let sent = mailer.sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "⏰ Relatório ICMS Agendado - 19/10/2026");
        assert_eq!(sent[0].to, vec!["ops@example.org".to_string()]);
        let attachment = sent[0].attachment.as_ref().expect("attachment");
        assert_eq!(attachment.filename, "relatorio_ICMS_2026-10-19.xlsx");
        assert!(!attachment.bytes.is_empty());
        assert!(!dir.path().join("relatorio_ICMS_2026-10-19.xlsx").exists());
    }

    #[tokio::test]
    async fn report_dates_follow_schedule_zone() {
        let dir = tempdir().expect("tempdir");
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = EmailReportNotifier::new(config(dir.path()), mailer.clone());
        let now = DateTime::parse_from_rfc3339("2026-11-01T01:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        notifier
            .send_report(&summary(), ExecutionMode::Scheduled, now)
            .await
            .expect("send");

        let sent = mailer.sent.lock().expect("lock");
        assert_eq!(sent[0].subject, "⏰ Relatório ICMS Agendado - 31/10/2026");
        let attachment = sent[0].attachment.as_ref().expect("attachment");
        assert_eq!(attachment.filename, "relatorio_ICMS_2026-10-31.xlsx");
        assert!(sent[0].html_body.contains("às 02:00 (amanhã)"));
    }

    #[tokio::test]
    async fn failed_delivery_keeps_temp_file() {
        let dir = tempdir().expect("tempdir");
        let mailer = Arc::new(RecordingMailer {
            fail: true,
            ..Default::default()
        });
        let notifier = EmailReportNotifier::new(config(dir.path()), mailer);
        let now = DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let result = notifier.send_report(&summary(), ExecutionMode::Forced, now).await;
        assert!(matches!(result, Err(ReportError::Message(_))));
        assert!(dir.path().join("relatorio_ICMS_2026-10-19.xlsx").exists());
    }

    #[test]
    fn message_includes_attachment() {
        let from: Mailbox = DEFAULT_SENDER.parse().expect("sender");
        let message = build_message(
            &from,
            &OutgoingEmail {
                to: vec!["ops@example.org".into()],
                subject: "teste".into(),
                html_body: "<p>ok</p>".into(),
                attachment: Some(EmailAttachment {
                    filename: "relatorio.xlsx".into(),
                    bytes: vec![1, 2, 3],
                }),
            },
        )
        .expect("message");
        let raw = String::from_utf8_lossy(&message.formatted()).into_owned();
        assert!(raw.contains("relatorio.xlsx"));
        assert!(raw.contains("spreadsheetml"));
    }
}
