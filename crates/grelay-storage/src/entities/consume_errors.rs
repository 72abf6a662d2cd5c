use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "consume_errors")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: OffsetDateTime,
    pub request_id: String,
    pub request_at: OffsetDateTime,
    pub group_id: String,
    pub token_id: i64,
    pub token_name: String,
    pub model: String,
    pub error: String,
    pub amount: String,
}

impl ActiveModelBehavior for ActiveModel {}
