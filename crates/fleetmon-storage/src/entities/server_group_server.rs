use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "server_group_servers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub server_group_id: i64,
    #[sea_orm(indexed)]
    pub server_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
