use std::str::FromStr;

use async_trait::async_trait;
use grelay_relay_core::{
    ConsumeErrorRecord, ConsumeRecord, ConsumptionRecorder, RelayMode, RequestDetail,
    ServiceError,
};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveValue, ColumnTrait, Database, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Schema, TransactionTrait,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

use crate::entities::{self, consume_errors, consume_logs, request_details};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Db(#[from] DbErr),
    #[error("stored value `{0}` is not a decimal")]
    Decimal(String),
    #[error("stored relay mode {0} is unknown")]
    Mode(i32),
}

/// A consumption row read back with its optional detail.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConsumption {
    pub id: i64,
    pub record: ConsumeRecord,
}

#[derive(Clone)]
pub struct ConsumeStorage {
    db: DatabaseConnection,
}

impl ConsumeStorage {
    pub async fn connect(database_url: &str) -> Result<Self, DbErr> {
        let db = Database::connect(database_url).await?;
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ConsumeLogs)
            .register(entities::RequestDetails)
            .register(entities::ConsumeErrors)
            .sync(&self.db)
            .await
    }

    /// Writes the log row and its detail in one transaction. Returns the log id.
    pub async fn insert_consumption(&self, record: ConsumeRecord) -> Result<i64, DbErr> {
        let now = OffsetDateTime::now_utc();
        let detail = record.detail.clone();
        let mut active: consume_logs::ActiveModel = record.into();
        active.created_at = ActiveValue::Set(now);

        let txn = self.db.begin().await?;
        let log_id = entities::ConsumeLogs::insert(active)
            .exec(&txn)
            .await?
            .last_insert_id;
        if let Some(detail) = detail {
            let active = request_details::ActiveModel {
                id: ActiveValue::NotSet,
                log_id: ActiveValue::Set(log_id),
                created_at: ActiveValue::Set(now),
                request_body: ActiveValue::Set(detail.request_body),
                response_body: ActiveValue::Set(detail.response_body),
                request_body_truncated: ActiveValue::Set(detail.request_body_truncated),
                response_body_truncated: ActiveValue::Set(detail.response_body_truncated),
                ..Default::default()
            };
            entities::RequestDetails::insert(active).exec(&txn).await?;
        }
        txn.commit().await?;
        debug!(event = "consume_log_stored", log_id);
        Ok(log_id)
    }

    pub async fn insert_consume_error(&self, record: ConsumeErrorRecord) -> Result<(), DbErr> {
        let active = consume_errors::ActiveModel {
            id: ActiveValue::NotSet,
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            request_id: ActiveValue::Set(record.request_id),
            request_at: ActiveValue::Set(record.request_at),
            group_id: ActiveValue::Set(record.group_id),
            token_id: ActiveValue::Set(record.token_id),
            token_name: ActiveValue::Set(record.token_name),
            model: ActiveValue::Set(record.model),
            error: ActiveValue::Set(record.error),
            amount: ActiveValue::Set(record.amount.to_string()),
            ..Default::default()
        };
        entities::ConsumeErrors::insert(active).exec(&self.db).await?;
        Ok(())
    }

    /// Every attempt recorded under `request_id`, oldest first.
    pub async fn consumption_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<StoredConsumption>, StorageError> {
        let rows = entities::ConsumeLogs::find()
            .filter(consume_logs::Column::RequestId.eq(request_id))
            .order_by_asc(consume_logs::Column::Id)
            .all(&self.db)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let detail = entities::RequestDetails::find()
                .filter(request_details::Column::LogId.eq(row.id))
                .one(&self.db)
                .await?
                .map(|detail| RequestDetail {
                    request_body: detail.request_body,
                    response_body: detail.response_body,
                    request_body_truncated: detail.request_body_truncated,
                    response_body_truncated: detail.response_body_truncated,
                });
            out.push(StoredConsumption {
                id: row.id,
                record: to_record(row, detail)?,
            });
        }
        Ok(out)
    }

    pub async fn consume_errors_for_group(
        &self,
        group_id: &str,
    ) -> Result<Vec<ConsumeErrorRecord>, StorageError> {
        let rows = entities::ConsumeErrors::find()
            .filter(consume_errors::Column::GroupId.eq(group_id))
            .order_by_asc(consume_errors::Column::Id)
            .all(&self.db)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(ConsumeErrorRecord {
                    amount: decimal(&row.amount)?,
                    request_id: row.request_id,
                    request_at: row.request_at,
                    group_id: row.group_id,
                    token_id: row.token_id,
                    token_name: row.token_name,
                    model: row.model,
                    error: row.error,
                })
            })
            .collect()
    }
}

fn decimal(value: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(value).map_err(|_| StorageError::Decimal(value.to_string()))
}

fn mode_from_code(code: i32) -> Result<RelayMode, StorageError> {
    RelayMode::ALL
        .into_iter()
        .find(|mode| mode.code() == code)
        .ok_or(StorageError::Mode(code))
}

fn to_record(
    row: consume_logs::Model,
    detail: Option<RequestDetail>,
) -> Result<ConsumeRecord, StorageError> {
    Ok(ConsumeRecord {
        amount: decimal(&row.amount)?,
        input_price: decimal(&row.input_price)?,
        output_price: decimal(&row.output_price)?,
        price_unit: decimal(&row.price_unit)?,
        mode: mode_from_code(row.mode)?,
        request_id: row.request_id,
        request_at: row.request_at,
        group_id: row.group_id,
        code: u16::try_from(row.code).unwrap_or_default(),
        channel_id: row.channel_id,
        prompt_tokens: u64::try_from(row.prompt_tokens).unwrap_or_default(),
        completion_tokens: u64::try_from(row.completion_tokens).unwrap_or_default(),
        model: row.model,
        token_id: row.token_id,
        token_name: row.token_name,
        endpoint: row.endpoint,
        content: row.content,
        retry_times: u32::try_from(row.retry_times).unwrap_or_default(),
        detail,
    })
}

impl From<ConsumeRecord> for consume_logs::ActiveModel {
    fn from(record: ConsumeRecord) -> Self {
        consume_logs::ActiveModel {
            id: ActiveValue::NotSet,
            created_at: ActiveValue::NotSet,
            request_id: ActiveValue::Set(record.request_id),
            request_at: ActiveValue::Set(record.request_at),
            group_id: ActiveValue::Set(record.group_id),
            token_id: ActiveValue::Set(record.token_id),
            token_name: ActiveValue::Set(record.token_name),
            channel_id: ActiveValue::Set(record.channel_id),
            model: ActiveValue::Set(record.model),
            code: ActiveValue::Set(i32::from(record.code)),
            mode: ActiveValue::Set(record.mode.code()),
            endpoint: ActiveValue::Set(record.endpoint),
            prompt_tokens: ActiveValue::Set(i64::try_from(record.prompt_tokens).unwrap_or(i64::MAX)),
            completion_tokens: ActiveValue::Set(
                i64::try_from(record.completion_tokens).unwrap_or(i64::MAX),
            ),
            amount: ActiveValue::Set(record.amount.to_string()),
            input_price: ActiveValue::Set(record.input_price.to_string()),
            output_price: ActiveValue::Set(record.output_price.to_string()),
            price_unit: ActiveValue::Set(record.price_unit.to_string()),
            content: ActiveValue::Set(record.content),
            retry_times: ActiveValue::Set(i32::try_from(record.retry_times).unwrap_or(i32::MAX)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConsumptionRecorder for ConsumeStorage {
    async fn record_consumption(&self, record: ConsumeRecord) -> Result<(), ServiceError> {
        self.insert_consumption(record)
            .await
            .map(|_| ())
            .map_err(|err| ServiceError::Record(err.to_string()))
    }

    async fn record_consume_error(&self, record: ConsumeErrorRecord) -> Result<(), ServiceError> {
        self.insert_consume_error(record)
            .await
            .map_err(|err| ServiceError::Record(err.to_string()))
    }
}
