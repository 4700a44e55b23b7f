use std::io::Write;

use anyhow::Result;
use tabwriter::TabWriter;

use crate::link::Linked;
use crate::sync::JobOutcome;
use crate::upstream::Requisition;

pub fn print_outcomes<T: std::io::Write>(wr: T, outcomes: &[JobOutcome]) -> Result<()> {
    let mut tw = TabWriter::new(wr);
    writeln!(tw, "Source\tBudget\tDestination\tFetched\tCreated\tDuplicates\tStatus")?;

    for outcome in outcomes.iter() {
        let job = &outcome.job;
        match &outcome.result {
            Ok(summary) => writeln!(
                tw,
                "{}\t{}\t{}\t{}\t{}\t{}\tok",
                job.source_account,
                job.budget,
                job.destination_account,
                summary.fetched,
                summary.created,
                summary.duplicates,
            )?,
            Err(err) => writeln!(
                tw,
                "{}\t{}\t{}\t-\t-\t-\t{}",
                job.source_account, job.budget, job.destination_account, err,
            )?,
        }
    }

    tw.flush()?;

    Ok(())
}

pub fn print_accounts<T: std::io::Write>(wr: T, linked: &Linked) -> Result<()> {
    let mut tw = TabWriter::new(wr);
    writeln!(tw, "Requisition\tAccount ID")?;

    for account in linked.accounts.iter() {
        writeln!(tw, "{}\t{}", linked.requisition_id, account)?;
    }

    tw.flush()?;

    Ok(())
}

pub fn print_requisitions<T: std::io::Write>(wr: T, requisitions: &[Requisition]) -> Result<()> {
    let mut tw = TabWriter::new(wr);
    writeln!(tw, "Requisition\tInstitution\tStatus\tAccounts")?;

    for requisition in requisitions.iter() {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}",
            requisition.id,
            requisition.institution_id,
            requisition.status,
            requisition.accounts.len(),
        )?;
    }

    tw.flush()?;

    Ok(())
}
