//! Job inspection commands (`genforge jobs`).

use std::path::Path;

use anyhow::{Context, Result};
use genforge::relay::db::DbHandle;
use genforge::relay::store::JobStore;

use super::super::JobsCommands;

pub async fn cmd_jobs(config_path: &Path, command: JobsCommands) -> Result<()> {
    let config = super::load_config(config_path)?;
    if !config.database.path.exists() {
        anyhow::bail!(
            "No database at {}. Run 'genforge init' first.",
            config.database.path.display()
        );
    }
    let db = DbHandle::open(&config.database.path)?;

    match command {
        JobsCommands::List { owner, limit } => {
            let jobs = db.list_jobs_for_owner(&owner, limit).await?;
            if jobs.is_empty() {
                println!("No jobs for {}", owner);
                return Ok(());
            }
            println!("{:<6} {:<11} {:<5} {:<26} INSTRUCTION", "ID", "STATUS", "ITER", "CREATED");
            for job in jobs {
                let mut instruction = job.instruction.replace('\n', " ");
                if instruction.chars().count() > 60 {
                    instruction = instruction.chars().take(57).collect::<String>() + "...";
                }
                println!(
                    "{:<6} {:<11} {:<5} {:<26} {}",
                    job.id, job.status.as_str(), job.current_iteration, job.created_at, instruction
                );
            }
        }
        JobsCommands::Show { id } => {
            let job = db
                .get_job(id)
                .await?
                .with_context(|| format!("Job {} not found", id))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobsCommands::Snapshots { id } => {
            let snapshots = db.list_snapshots_for_job(id).await?;
            if snapshots.is_empty() {
                println!("No snapshots for job {}", id);
                return Ok(());
            }
            println!("{:<6} {:<10} {:<26} INSTRUCTION", "ITER", "KIND", "CREATED");
            for snapshot in snapshots {
                println!(
                    "{:<6} {:<10} {:<26} {}",
                    snapshot.iteration,
                    snapshot.kind.as_str(),
                    snapshot.created_at,
                    snapshot.instruction.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
