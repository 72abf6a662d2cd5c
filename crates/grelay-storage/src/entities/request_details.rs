use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_details")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub log_id: i64,
    pub created_at: OffsetDateTime,
    pub request_body: String,
    pub response_body: String,
    pub request_body_truncated: bool,
    pub response_body_truncated: bool,
    #[sea_orm(belongs_to, from = "log_id", to = "id")]
    pub log: HasOne<super::consume_logs::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
