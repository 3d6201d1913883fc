use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "crons")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub user_id: i64,
    pub name: String,
    /// 0 = scheduled, 1 = alert-triggered.
    pub task_type: i32,
    /// Cron spec; unused for alert-triggered tasks.
    pub scheduler: String,
    #[sea_orm(column_type = "Text")]
    pub command: String,
    /// JSON list of server ids interpreted through `cover`.
    pub servers_raw: String,
    /// 0 = all except listed, 1 = only listed, 2 = alert-trigger target.
    pub cover: i32,
    pub push_successful: bool,
    pub notification_group_id: i64,
    pub last_executed_at: Option<DateTimeUtc>,
    pub last_result: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
