use anyhow::{Context, Result};
use atelier_db::{Database, DbError};
use std::io::{self, BufRead, Write};

pub async fn status(db: &Database, json: bool) -> Result<()> {
    let status = db
        .migrator()
        .status()
        .await
        .context("failed to read migration status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Executed ({}):", status.total_executed);
    for name in &status.executed {
        println!("  [x] {name}");
    }
    println!("Pending ({}):", status.total_pending);
    for name in &status.pending {
        println!("  [ ] {name}");
    }
    Ok(())
}

pub async fn migrate(db: &Database, assume_yes: bool) -> Result<()> {
    let status = db
        .migrator()
        .status()
        .await
        .context("failed to read migration status")?;
    if status.pending.is_empty() {
        println!("Nothing to migrate.");
        return Ok(());
    }

    println!("{} pending migration(s):", status.total_pending);
    for name in &status.pending {
        println!("  {name}");
    }
    if !assume_yes && !confirm("Apply them now?")? {
        println!("Aborted.");
        return Ok(());
    }

    let outcome = db.migrator().run().await.context("migration run failed")?;
    for name in &outcome.executed {
        println!("Migrated: {name}");
    }
    if let Some(batch) = outcome.batch {
        println!("Batch {batch}: {} applied", outcome.executed.len());
    }

    match outcome.errors.into_iter().next() {
        Some(failure) => Err(DbError::from(failure).into()),
        None => Ok(()),
    }
}

pub async fn rollback(db: &Database, assume_yes: bool) -> Result<()> {
    if !assume_yes && !confirm("Roll back the most recent migration batch?")? {
        println!("Aborted.");
        return Ok(());
    }

    let outcome = db.migrator().rollback().await.context("rollback failed")?;
    let Some(batch) = outcome.batch else {
        println!("Nothing to roll back.");
        return Ok(());
    };

    for name in &outcome.rolledback {
        println!("Rolled back: {name}");
    }
    println!("Batch {batch}: {} reverted", outcome.rolledback.len());

    match outcome.errors.into_iter().next() {
        Some(failure) => Err(DbError::from(failure).into()),
        None => Ok(()),
    }
}

pub async fn pool(db: &Database) -> Result<()> {
    println!("{}", db.pool().stats());
    let report = db
        .pool()
        .health_check()
        .await
        .context("pool health check failed")?;
    println!("{report}");
    println!("{}", db.pool().stats());
    Ok(())
}

pub async fn sweep(db: &Database) -> Result<()> {
    let report = db.admission().sweep().await.context("session sweep failed")?;
    println!(
        "Removed {} expired session(s). Capacity: {}/{} ({:.1}%)",
        report.removed, report.capacity.active, report.capacity.max, report.capacity.percentage
    );
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
