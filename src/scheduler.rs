//! Registering the periodic `autocert renew` run with the operating system.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    webserver::{CommandOutput, CommandRunner},
};

pub const DEFAULT_TASK_NAME: &str = "autocert-renew";

/// Every day at 02:00.
pub const DEFAULT_CRON: &str = "0 2 * * *";

/// A registered task as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: String,
    pub status: String,
    pub schedule: Option<String>,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Registers `executable renew` under `name`, replacing any task of the same name.
    async fn install(&self, name: &str, executable: &Path, cron: &str) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<TaskInfo>>;
}

/// The native scheduler of the current platform.
pub fn system_scheduler(runner: Arc<dyn CommandRunner>) -> Box<dyn Scheduler> {
    if cfg!(windows) {
        Box::new(SchtasksScheduler::new(runner))
    } else {
        Box::new(CrontabScheduler::new(runner))
    }
}

fn cron_fields(cron: &str) -> Result<Vec<&str>> {
    let fields = cron.split_whitespace().collect::<Vec<_>>();

    if fields.len() != 5 {
        return Err(Error::Scheduler(format!(
            "cron expression {cron:?} must have 5 fields"
        )));
    }

    Ok(fields)
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(Error::Scheduler(format!("invalid task name {name:?}")))
    }
}

fn command_failed(program: &str, output: &CommandOutput) -> Error {
    Error::Scheduler(format!("{program} failed: {}", output.combined()))
}

/// Entries in the user's crontab, tagged `# autocert:<name>`.
pub struct CrontabScheduler {
    runner: Arc<dyn CommandRunner>,
}

impl CrontabScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        CrontabScheduler { runner }
    }

    fn tag(name: &str) -> String {
        format!("# autocert:{name}")
    }

    async fn read(&self) -> Result<String> {
        let output = self
            .runner
            .run("crontab", &["-l".to_owned()])
            .await
            .map_err(|err| Error::Scheduler(format!("could not run crontab: {err}")))?;

        if output.success {
            return Ok(output.stdout);
        }

        // first use
        if output.stderr.contains("no crontab") {
            return Ok(String::new());
        }

        Err(command_failed("crontab -l", &output))
    }

    async fn write(&self, table: &str) -> Result<()> {
        let output = self
            .runner
            .run_with_input("crontab", &["-".to_owned()], table)
            .await
            .map_err(|err| Error::Scheduler(format!("could not run crontab: {err}")))?;

        if !output.success {
            return Err(command_failed("crontab -", &output));
        }

        Ok(())
    }
}

/// Lines of `table` not tagged with `name`, and whether any were dropped.
fn without_task(table: &str, name: &str) -> (Vec<String>, bool) {
    let tag = CrontabScheduler::tag(name);
    let mut removed = false;

    let kept = table
        .lines()
        .filter(|line| {
            let tagged = line.trim_end().ends_with(&tag);
            removed |= tagged;
            !tagged
        })
        .map(ToOwned::to_owned)
        .collect();

    (kept, removed)
}

fn render_table(lines: &[String]) -> String {
    let mut table = lines.join("\n");
    if !table.is_empty() {
        table.push('\n');
    }
    table
}

#[async_trait]
impl Scheduler for CrontabScheduler {
    async fn install(&self, name: &str, executable: &Path, cron: &str) -> Result<()> {
        check_name(name)?;
        cron_fields(cron)?;

        let table = self.read().await?;
        let (mut lines, replaced) = without_task(&table, name);

        lines.push(format!(
            "{cron} \"{}\" renew {}",
            executable.display(),
            Self::tag(name)
        ));
        self.write(&render_table(&lines)).await?;

        if replaced {
            log::info!("replaced crontab entry {name}");
        } else {
            log::info!("added crontab entry {name}");
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        check_name(name)?;

        let table = self.read().await?;
        let (lines, removed) = without_task(&table, name);

        if !removed {
            return Err(Error::Scheduler(format!("no crontab entry named {name}")));
        }

        self.write(&render_table(&lines)).await?;
        log::info!("removed crontab entry {name}");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TaskInfo>> {
        let table = self.read().await?;

        let tasks = table
            .lines()
            .filter_map(|line| {
                let (entry, name) = line.trim_end().rsplit_once("# autocert:")?;
                let commented = entry.trim_start().starts_with('#');

                let schedule = entry
                    .trim_start_matches('#')
                    .split_whitespace()
                    .take(5)
                    .collect::<Vec<_>>()
                    .join(" ");

                Some(TaskInfo {
                    name: name.trim().to_owned(),
                    status: if commented { "disabled" } else { "enabled" }.to_owned(),
                    schedule: Some(schedule),
                    next_run: None,
                    last_run: None,
                })
            })
            .collect();

        Ok(tasks)
    }
}

/// Windows Task Scheduler through `schtasks.exe`.
pub struct SchtasksScheduler {
    runner: Arc<dyn CommandRunner>,
}

impl SchtasksScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        SchtasksScheduler { runner }
    }

    async fn schtasks(&self, args: &[&str]) -> Result<CommandOutput> {
        let args = args.iter().map(|arg| (*arg).to_owned()).collect::<Vec<_>>();

        let output = self
            .runner
            .run("schtasks", &args)
            .await
            .map_err(|err| Error::Scheduler(format!("could not run schtasks: {err}")))?;

        if !output.success {
            return Err(command_failed("schtasks", &output));
        }

        Ok(output)
    }
}

/// Start time `HH:MM` for a daily cron expression (`M H * * *`).
fn daily_start_time(cron: &str) -> Result<String> {
    let fields = cron_fields(cron)?;

    let (minute, hour) = match (fields[0].parse::<u8>(), fields[1].parse::<u8>()) {
        (Ok(minute), Ok(hour)) if minute < 60 && hour < 24 => (minute, hour),
        _ => {
            return Err(Error::Scheduler(format!(
                "cron expression {cron:?} needs a fixed minute and hour"
            )))
        }
    };

    if fields[2..] != ["*", "*", "*"] {
        return Err(Error::Scheduler(format!(
            "only daily cron expressions are supported on Windows, got {cron:?}"
        )));
    }

    Ok(format!("{hour:02}:{minute:02}"))
}

/// Splits one line of `schtasks /FO CSV` output.
fn csv_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }

    fields.push(field);
    fields
}

#[async_trait]
impl Scheduler for SchtasksScheduler {
    async fn install(&self, name: &str, executable: &Path, cron: &str) -> Result<()> {
        check_name(name)?;
        let start = daily_start_time(cron)?;
        let run = format!("\"{}\" renew", executable.display());

        self.schtasks(&[
            "/Create", "/F", "/TN", name, "/TR", &run, "/SC", "DAILY", "/ST", &start, "/RU",
            "SYSTEM",
        ])
        .await?;

        log::info!("registered scheduled task {name} daily at {start}");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        check_name(name)?;
        self.schtasks(&["/Delete", "/F", "/TN", name]).await?;

        log::info!("removed scheduled task {name}");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TaskInfo>> {
        let output = self.schtasks(&["/Query", "/FO", "CSV", "/NH", "/V"]).await?;

        // HostName, TaskName, Next Run Time, Status, Logon Mode, Last Run Time, Last Result,
        // Author, Task To Run, ...
        let tasks = output
            .stdout
            .lines()
            .map(csv_fields)
            .filter(|row| row.len() > 8 && row[8].contains("autocert"))
            .map(|row| TaskInfo {
                name: row[1].trim_start_matches('\\').to_owned(),
                status: row[3].clone(),
                schedule: None,
                next_run: Some(row[2].clone()),
                last_run: Some(row[5].clone()),
            })
            .collect();

        Ok(tasks)
    }
}
