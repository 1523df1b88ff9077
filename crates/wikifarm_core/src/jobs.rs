//! Deferred wiki creation through the `farm_jobs` queue.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, format_mw_timestamp, parse_mw_timestamp};
use crate::provision::{ProvisionRequest, Provisioner, requested_link};
use crate::request::RequestId;

pub const CREATE_WIKI_JOB: &str = "createwiki";

/// Snapshot of a request taken at approval time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWikiJob {
    pub id: Option<RequestId>,
    pub dbname: String,
    pub sitename: String,
    pub language: String,
    pub description: String,
    pub private: bool,
    pub category: String,
    pub requester: String,
    pub creator: String,
}

impl CreateWikiJob {
    pub fn provision_request(&self) -> ProvisionRequest {
        let reason = match self.id {
            Some(id) => requested_link(id),
            None => "[[Special:RequestWikiQueue|Requested]]".to_string(),
        };
        ProvisionRequest {
            dbname: self.dbname.clone(),
            sitename: self.sitename.clone(),
            language: self.language.clone(),
            description: self.description.clone(),
            private: self.private,
            category: self.category.clone(),
            requester: self.requester.clone(),
            creator: self.creator.clone(),
            reason,
        }
    }
}

/// Fire-and-forget hand-off of a wiki creation job.
pub trait JobSubmitter {
    fn submit(&self, job: &CreateWikiJob) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "done" => Self::Done,
            "failed" => Self::Failed,
            other => bail!("unknown job status: {other}"),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedJob {
    pub job_id: i64,
    pub status: JobStatus,
    pub job: CreateWikiJob,
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRunReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct SqliteJobQueue<'a> {
    connection: &'a Connection,
    clock: &'a dyn Clock,
}

impl<'a> SqliteJobQueue<'a> {
    pub fn new(connection: &'a Connection, clock: &'a dyn Clock) -> Self {
        Self { connection, clock }
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Result<Vec<QueuedJob>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT job_id, job_status, job_params, job_error, job_queued_at, job_finished_at
                 FROM farm_jobs
                 WHERE job_type = ?1
                 ORDER BY job_id ASC",
            )
            .context("failed to prepare job listing")?;
        let rows = statement
            .query_map([CREATE_WIKI_JOB], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .context("failed to run job listing")?;

        let mut out = Vec::new();
        for row in rows {
            let (job_id, status, params, error, queued_at, finished_at) =
                row.context("failed to read job row")?;
            out.push(QueuedJob {
                job_id,
                status: JobStatus::parse(&status)?,
                job: decode_job(job_id, &params)?,
                error,
                queued_at: parse_mw_timestamp(&queued_at)?,
                finished_at: finished_at
                    .as_deref()
                    .map(parse_mw_timestamp)
                    .transpose()?,
            });
        }
        Ok(out)
    }

    /// Move the oldest queued job to `running` and return it.
    fn claim_next(&self) -> Result<Option<(i64, CreateWikiJob)>> {
        let next: Option<(i64, String)> = self
            .connection
            .query_row(
                "SELECT job_id, job_params FROM farm_jobs
                 WHERE job_type = ?1 AND job_status = ?2
                 ORDER BY job_id ASC
                 LIMIT 1",
                params![CREATE_WIKI_JOB, JobStatus::Queued.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to look up next queued job")?;
        let Some((job_id, params)) = next else {
            return Ok(None);
        };

        self.connection
            .execute(
                "UPDATE farm_jobs SET job_status = ?1 WHERE job_id = ?2",
                params![JobStatus::Running.as_str(), job_id],
            )
            .with_context(|| format!("failed to claim job {job_id}"))?;
        Ok(Some((job_id, decode_job(job_id, &params)?)))
    }

    fn finish(&self, job_id: i64, error: Option<&str>) -> Result<()> {
        let status = if error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Done
        };
        self.connection
            .execute(
                "UPDATE farm_jobs
                 SET job_status = ?1, job_error = ?2, job_finished_at = ?3
                 WHERE job_id = ?4",
                params![
                    status.as_str(),
                    error,
                    format_mw_timestamp(self.clock.now()),
                    job_id
                ],
            )
            .with_context(|| format!("failed to finish job {job_id}"))?;
        Ok(())
    }
}

impl JobSubmitter for SqliteJobQueue<'_> {
    fn submit(&self, job: &CreateWikiJob) -> Result<()> {
        let params_json = serde_json::to_string(job).context("failed to encode job params")?;
        self.connection
            .execute(
                "INSERT INTO farm_jobs (job_type, job_params, job_status, job_queued_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    CREATE_WIKI_JOB,
                    params_json,
                    JobStatus::Queued.as_str(),
                    format_mw_timestamp(self.clock.now()),
                ],
            )
            .with_context(|| format!("failed to queue creation of {}", job.dbname))?;
        tracing::debug!(dbname = %job.dbname, "queued wiki creation job");
        Ok(())
    }
}

/// Provision up to `limit` queued jobs in FIFO order.
///
/// A job that fails validation or provisioning is marked `failed` with the
/// error text; the run carries on with the next one.
pub fn run_pending_jobs(
    queue: &SqliteJobQueue<'_>,
    provisioner: &dyn Provisioner,
    limit: usize,
) -> Result<JobRunReport> {
    let mut report = JobRunReport::default();
    for _ in 0..limit {
        let Some((job_id, job)) = queue.claim_next()? else {
            break;
        };
        let outcome = provisioner
            .validate_name(&job.dbname)
            .and_then(|()| provisioner.provision(&job.provision_request()));
        match outcome {
            Ok(()) => {
                queue.finish(job_id, None)?;
                report.succeeded.push(job.dbname);
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(job_id, dbname = %job.dbname, error = %message, "wiki creation job failed");
                queue.finish(job_id, Some(&message))?;
                report.failed.push((job.dbname, message));
            }
        }
    }
    Ok(report)
}

fn decode_job(job_id: i64, params: &str) -> Result<CreateWikiJob> {
    serde_json::from_str(params).with_context(|| format!("failed to decode params of job {job_id}"))
}
