use mailflow::db;
use mailflow::jobs::{Job, JobState, PgJobsRepo, Scheduler, SystemClock};
use mailflow::mail::EmailPayload;
use mailflow::telemetry::{self, LogFormat};

use std::env;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const USAGE: &str = "mailflowctl <command>\n\
     Commands:\n\
     - enqueue <to> [template] [delay_secs]\n\
     - get <job_id>\n\
     - cancel <job_id>\n\
     - replay <job_id>\n\
     - dlq [limit]\n\
     - counts\n\
     - purge <hours>\n\
     - reset\n\
     \n\
     Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init(LogFormat::Pretty);

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;

    let pool = db::make_pool(&url).await?;
    db::run_migrations(&pool).await?;

    let repo = PgJobsRepo::new(pool.clone());
    let scheduler = Scheduler::new(Arc::new(repo), Arc::new(SystemClock));

    match args[1].as_str() {
        "enqueue" => {
            let to = arg(&args, 2, "usage: mailflowctl enqueue <to> [template] [delay_secs]")?;
            let template = args.get(3).cloned().unwrap_or_else(|| "welcome".to_string());
            let delay_secs: u64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(1);

            let email = EmailPayload::new(to, template);
            let job_id = scheduler
                .enqueue(email.to_value(), Duration::from_secs(delay_secs))
                .await?;
            println!("+ enqueued job id={job_id} to={} delay={delay_secs}s", email.to);
        }
        "get" => {
            let id = job_id(&args, "usage: mailflowctl get <job_id>")?;
            match scheduler.get(id).await? {
                Some(job) => print_job(&job),
                None => println!("job {id} not found"),
            }
        }
        "cancel" => {
            let id = job_id(&args, "usage: mailflowctl cancel <job_id>")?;
            if scheduler.cancel(id).await? {
                println!("cancelled {id}");
            } else {
                println!("job {id} is not pending; nothing cancelled");
            }
        }
        "replay" => {
            let id = job_id(&args, "usage: mailflowctl replay <job_id>")?;
            match scheduler.replay(id).await? {
                Some(new_id) => println!("replayed {id} as {new_id}"),
                None => println!("job {id} is not dead-lettered; nothing replayed"),
            }
        }
        "dlq" => {
            let limit: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(20);
            let jobs = scheduler.dead_letters(limit).await?;
            println!("{} dead-lettered job(s)", jobs.len());
            for job in &jobs {
                print_job(job);
            }
        }
        "counts" => {
            let counts = scheduler.counts().await?;
            let line: Vec<String> = JobState::ALL
                .iter()
                .map(|st| format!("{}={}", st, counts.get(*st)))
                .collect();
            println!("jobs: {}", line.join(" "));
        }
        "purge" => {
            let hours: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(24 * 7);
            let purged = scheduler
                .purge_finished(Duration::from_secs(hours.saturating_mul(3600)), 10_000)
                .await?;
            println!("purged {purged} finished job(s) older than {hours}h");
        }
        "reset" => {
            sqlx::query("TRUNCATE TABLE jobs").execute(&pool).await?;
            println!("reset OK");
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn arg<'a>(args: &'a [String], idx: usize, usage: &str) -> anyhow::Result<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("{usage}"))
}

fn job_id(args: &[String], usage: &str) -> anyhow::Result<Uuid> {
    Ok(arg(args, 2, usage)?.parse()?)
}

fn print_job(job: &Job) {
    println!(
        "JOB: id={} state={} attempts={}/{} not_before={} lease_expiry={:?} leased_by={:?} last_error={:?} replay_of={:?}",
        job.id,
        job.state,
        job.attempts,
        job.max_attempts,
        job.not_before,
        job.lease_expiry,
        job.leased_by,
        job.last_error,
        job.replay_of,
    );
    println!("     payload={}", job.payload);
}
