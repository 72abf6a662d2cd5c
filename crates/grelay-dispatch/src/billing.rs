use std::sync::Arc;

use grelay_relay_core::{
    BillingPrice, BillingTasks, ConsumeErrorRecord, ConsumeRecord, ConsumptionRecorder,
    GroupConsumer, Meta, RelayMode, RequestDetail, Usage, truncate_content,
};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{error, info};

pub fn compute_amount(usage: &Usage, price: &BillingPrice) -> Decimal {
    if price.price_unit.is_zero() {
        return Decimal::ZERO;
    }
    let input = Decimal::from(usage.prompt_tokens) * price.input_price / price.price_unit;
    let output = Decimal::from(usage.completion_tokens) * price.output_price / price.price_unit;
    input + output
}

/// Everything billing needs from a finished attempt, detached from `Meta`.
#[derive(Debug, Clone)]
pub struct ConsumeContext {
    pub request_id: String,
    pub request_at: OffsetDateTime,
    pub group_id: String,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    pub model: String,
    pub endpoint: String,
    pub mode: RelayMode,
    pub retry_times: u32,
    pub price: BillingPrice,
    pub code: u16,
    pub usage: Usage,
    pub content: String,
    pub detail: Option<RequestDetail>,
}

impl ConsumeContext {
    pub fn from_meta(meta: &Meta, code: u16, usage: Usage, content: &str) -> Self {
        Self {
            request_id: meta.request_id.clone(),
            request_at: meta.request_at,
            group_id: meta.group.id.clone(),
            token_id: meta.token.id,
            token_name: meta.token.name.clone(),
            channel_id: meta.channel.id,
            model: meta.origin_model.clone(),
            endpoint: meta.endpoint.clone(),
            mode: meta.mode,
            retry_times: meta.retry_times,
            price: meta.billing_price,
            code,
            usage,
            content: truncate_content(content),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Option<RequestDetail>) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Clone)]
pub struct Billing {
    recorder: Arc<dyn ConsumptionRecorder>,
    tasks: BillingTasks,
}

impl Billing {
    pub fn new(recorder: Arc<dyn ConsumptionRecorder>, tasks: BillingTasks) -> Self {
        Self { recorder, tasks }
    }

    pub fn tasks(&self) -> &BillingTasks {
        &self.tasks
    }

    /// Bills on a detached task so the caller never waits on the ledger.
    pub fn spawn_consume(&self, consumer: Option<Box<dyn GroupConsumer>>, ctx: ConsumeContext) {
        let recorder = self.recorder.clone();
        self.tasks.spawn("consume", async move {
            consume(recorder.as_ref(), consumer.as_deref(), ctx).await;
        });
    }
}

/// Deducts and writes exactly one consumption record. A failed deduction also
/// leaves a consume-error record carrying the intended amount.
pub async fn consume(
    recorder: &dyn ConsumptionRecorder,
    consumer: Option<&dyn GroupConsumer>,
    ctx: ConsumeContext,
) -> ConsumeRecord {
    let mut amount = compute_amount(&ctx.usage, &ctx.price);
    if let Some(consumer) = consumer.filter(|_| amount > Decimal::ZERO) {
        match consumer.consume(&ctx.token_name, amount).await {
            Ok(actual) => amount = actual,
            Err(err) => {
                error!(
                    event = "consume_failed",
                    request_id = %ctx.request_id,
                    group = %ctx.group_id,
                    amount = %amount,
                    error = %err
                );
                let record = ConsumeErrorRecord {
                    request_id: ctx.request_id.clone(),
                    request_at: ctx.request_at,
                    group_id: ctx.group_id.clone(),
                    token_id: ctx.token_id,
                    token_name: ctx.token_name.clone(),
                    model: ctx.model.clone(),
                    error: err.to_string(),
                    amount,
                };
                if let Err(err) = recorder.record_consume_error(record).await {
                    error!(event = "consume_error_record_failed", request_id = %ctx.request_id, error = %err);
                }
            }
        }
    }

    let record = ConsumeRecord {
        request_id: ctx.request_id,
        request_at: ctx.request_at,
        group_id: ctx.group_id,
        code: ctx.code,
        channel_id: ctx.channel_id,
        prompt_tokens: ctx.usage.prompt_tokens,
        completion_tokens: ctx.usage.completion_tokens,
        model: ctx.model,
        token_id: ctx.token_id,
        token_name: ctx.token_name,
        amount,
        input_price: ctx.price.input_price,
        output_price: ctx.price.output_price,
        price_unit: ctx.price.price_unit,
        endpoint: ctx.endpoint,
        content: ctx.content,
        mode: ctx.mode,
        retry_times: ctx.retry_times,
        detail: ctx.detail,
    };
    info!(
        event = "consume",
        request_id = %record.request_id,
        group = %record.group_id,
        channel_id = record.channel_id,
        code = record.code,
        prompt_tokens = record.prompt_tokens,
        completion_tokens = record.completion_tokens,
        amount = %record.amount
    );
    if let Err(err) = recorder.record_consumption(record.clone()).await {
        error!(event = "consume_record_failed", request_id = %record.request_id, error = %err);
    }
    record
}
