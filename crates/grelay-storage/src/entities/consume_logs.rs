use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One row per finished attempt. Money columns hold decimal text so every
/// backend keeps the exact value.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "consume_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: OffsetDateTime,
    pub request_id: String,
    pub request_at: OffsetDateTime,
    pub group_id: String,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    pub model: String,
    pub code: i32,
    pub mode: i32,
    pub endpoint: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub amount: String,
    pub input_price: String,
    pub output_price: String,
    pub price_unit: String,
    pub content: String,
    pub retry_times: i32,
    #[sea_orm(has_one)]
    pub detail: HasOne<super::request_details::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
