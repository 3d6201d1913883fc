use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "notifications")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub user_id: i64,
    pub name: String,
    pub url: String,
    /// 1 = GET, 2 = POST.
    pub request_method: i32,
    /// 1 = JSON, 2 = form.
    pub request_type: i32,
    #[sea_orm(column_type = "Text")]
    pub request_header: String,
    #[sea_orm(column_type = "Text")]
    pub request_body: String,
    pub verify_tls: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
