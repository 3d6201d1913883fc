use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QuerySelect};

use crate::entities::transfer;
use crate::{Result, Store};

#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub server_id: u64,
    pub transfer_in: u64,
    pub transfer_out: u64,
    pub recorded_at: DateTime<Utc>,
}

impl Store {
    pub async fn insert_transfers(&self, rows: Vec<NewTransfer>) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.len() as u64;
        let models = rows.into_iter().map(|r| transfer::ActiveModel {
            id: NotSet,
            created_at: Set(r.recorded_at),
            server_id: Set(r.server_id as i64),
            transfer_in: Set(r.transfer_in as i64),
            transfer_out: Set(r.transfer_out as i64),
        });
        transfer::Entity::insert_many(models).exec(&self.db).await?;
        Ok(count)
    }

    /// Summed (in, out) bytes recorded for a server at or after `from`.
    pub async fn transfer_usage_since(
        &self,
        server_id: u64,
        from: DateTime<Utc>,
    ) -> Result<(u64, u64)> {
        let sums: Option<(Option<i64>, Option<i64>)> = transfer::Entity::find()
            .select_only()
            .column_as(transfer::Column::TransferIn.sum(), "in_sum")
            .column_as(transfer::Column::TransferOut.sum(), "out_sum")
            .filter(transfer::Column::ServerId.eq(server_id as i64))
            .filter(transfer::Column::CreatedAt.gte(from))
            .into_tuple()
            .one(&self.db)
            .await?;
        let (i, o) = sums.unwrap_or((None, None));
        Ok((i.unwrap_or(0).max(0) as u64, o.unwrap_or(0).max(0) as u64))
    }

    /// Retention pass driven by the active cycle-transfer rules: rows for
    /// deleted servers go unconditionally; servers pinned by a rule's ignore
    /// set keep data back to their own cycle start; everything else is
    /// trimmed to `all_keep` (or, when no global rule exists, kept only for
    /// the pinned servers).
    pub async fn prune_transfers(
        &self,
        live_server_ids: &[u64],
        all_keep: Option<DateTime<Utc>>,
        special_keep: &[(u64, DateTime<Utc>)],
    ) -> Result<()> {
        let live: Vec<i64> = live_server_ids.iter().map(|id| *id as i64).collect();
        transfer::Entity::delete_many()
            .filter(transfer::Column::ServerId.is_not_in(live))
            .exec(&self.db)
            .await?;

        for (server_id, keep) in special_keep {
            transfer::Entity::delete_many()
                .filter(transfer::Column::ServerId.eq(*server_id as i64))
                .filter(transfer::Column::CreatedAt.lt(*keep))
                .exec(&self.db)
                .await?;
        }

        let special: Vec<i64> = special_keep.iter().map(|(id, _)| *id as i64).collect();
        let mut delete = transfer::Entity::delete_many()
            .filter(transfer::Column::ServerId.is_not_in(special));
        match all_keep {
            Some(keep) => {
                delete = delete.filter(transfer::Column::CreatedAt.lt(keep));
                delete.exec(&self.db).await?;
            }
            None => {
                delete.exec(&self.db).await?;
            }
        }
        Ok(())
    }
}
