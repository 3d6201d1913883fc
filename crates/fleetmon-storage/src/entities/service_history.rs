use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "service_histories")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(indexed)]
    pub created_at: DateTimeUtc,
    #[sea_orm(indexed)]
    pub service_id: i64,
    /// 0 marks the aggregate row persisted when a sliding window fills.
    pub server_id: i64,
    pub avg_delay: f32,
    pub up: i64,
    pub down: i64,
    /// Last error text or `issuer|expiry` certificate pair.
    pub data: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
