use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "ddns_profiles")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub user_id: i64,
    pub name: String,
    /// Provider key: "dummy" or "webhook".
    pub provider: String,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    pub max_retries: i64,
    /// JSON list of managed domains.
    pub domains_raw: String,
    pub webhook_url: String,
    /// 1 = GET, 2 = POST.
    pub webhook_method: i32,
    #[sea_orm(column_type = "Text")]
    pub webhook_request_body: String,
    #[sea_orm(column_type = "Text")]
    pub webhook_headers: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
