use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "services")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub user_id: i64,
    pub name: String,
    pub target: String,
    /// Probe kind, same discriminator space as task types.
    pub kind: i64,
    /// Seconds-precision cron spec; empty means "every `duration` seconds".
    pub cron_spec: String,
    /// Probe interval / sampling window in seconds.
    pub duration: i64,
    /// JSON map of server id -> bool.
    pub skip_servers_raw: String,
    /// 0 = all except skipped, 1 = only listed.
    pub cover: i32,
    pub notify: bool,
    pub notification_group_id: i64,
    pub latency_notify: bool,
    pub min_latency: f32,
    pub max_latency: f32,
    pub enable_show_in_service: bool,
    pub enable_trigger_task: bool,
    pub fail_trigger_tasks_raw: String,
    pub recover_trigger_tasks_raw: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
