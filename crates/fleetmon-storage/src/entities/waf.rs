use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "fm_waf")]
pub struct Model {
    /// 16-byte canonical address (IPv4 stored v4-mapped).
    #[sea_orm(primary_key, auto_increment = false)]
    pub ip: Vec<u8>,
    /// Scope of the block: per-user id, or one of the reserved negative ids.
    #[sea_orm(primary_key, auto_increment = false)]
    pub block_identifier: i64,
    pub block_reason: i32,
    #[sea_orm(indexed)]
    pub block_timestamp: i64,
    pub count: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
