//! Orphan recharge cleanup
//!
//! A recharge is an orphan when no completed operator-report import covers
//! its SIM for the same period: the operator never confirmed paying
//! commission on it, so it must not feed downstream calculations. Deletion
//! runs in bounded chunks to keep each statement (and its lock) small on
//! large backlogs.

use anyhow::Result;
use rusqlite::{params, Connection};
use tracing::info;

pub const DEFAULT_CHUNK_SIZE: usize = 2000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanCleanupStats {
    pub deleted: usize,
    pub chunks: usize,
}

/// Delete orphaned recharges for one period, `chunk_size` rows at a time.
///
/// `on_chunk` is called after every chunk with the rows deleted so far, so
/// callers can surface progress. Rerunning after a successful pass is a
/// no-op; rerunning after an interrupted pass resumes where it stopped.
pub fn purge_orphan_recharges<F>(
    conn: &Connection,
    year: i32,
    month: u32,
    chunk_size: usize,
    mut on_chunk: F,
) -> Result<OrphanCleanupStats>
where
    F: FnMut(&OrphanCleanupStats),
{
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };

    let mut stats = OrphanCleanupStats::default();
    loop {
        let deleted = conn.execute(
            "DELETE FROM recharge_lines WHERE id IN (
                SELECT r.id FROM recharge_lines r
                WHERE r.period_year = ?1 AND r.period_month = ?2
                  AND r.sim_id NOT IN (
                      SELECT orl.sim_id FROM operator_report_lines orl
                      JOIN import_batches ib ON ib.id = orl.import_id
                      WHERE ib.status = 'COMPLETED'
                        AND orl.period_year = ?1 AND orl.period_month = ?2
                  )
                LIMIT ?3
            )",
            params![year, month, chunk_size as i64],
        )?;

        if deleted == 0 {
            break;
        }
        stats.deleted += deleted;
        stats.chunks += 1;
        on_chunk(&stats);
    }

    info!(
        year,
        month,
        deleted = stats.deleted,
        chunks = stats.chunks,
        "orphan recharge cleanup finished"
    );
    Ok(stats)
}
