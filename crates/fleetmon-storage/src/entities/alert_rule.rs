use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "alert_rules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub user_id: i64,
    pub name: String,
    /// JSON list of sub-rules; parsed by the alert layer.
    #[sea_orm(column_type = "Text")]
    pub rules_raw: String,
    pub enable: bool,
    /// 0 = always trigger, 1 = once per incident.
    pub trigger_mode: i32,
    pub notification_group_id: i64,
    /// JSON list of cron task ids.
    pub fail_trigger_tasks_raw: String,
    pub recover_trigger_tasks_raw: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
