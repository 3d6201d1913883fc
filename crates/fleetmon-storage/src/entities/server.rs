use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "servers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    #[sea_orm(indexed)]
    pub user_id: i64,
    pub name: String,
    #[sea_orm(unique)]
    pub uuid: String,
    pub note: String,
    pub public_note: String,
    pub display_index: i64,
    pub hide_for_guest: bool,
    pub enable_ddns: bool,
    /// JSON list of DDNS profile ids.
    pub ddns_profiles_raw: String,
    /// JSON map of profile id -> domain list.
    pub override_ddns_domains_raw: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
