use std::future::Future;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use grelay_relay_core::{
    Adaptor, AdaptorRegistry, BalanceService, BillingTasks, BufferPool, CallerRequest,
    CaptureWriter, ConsumptionRecorder, GroupConsumer, Meta, OutboundRequest, PricingCatalog,
    RelayError, RequestDetail, ResponseWriter, Usage, reconcile_usage,
};
use http::StatusCode;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::admission::{admit, estimated_amount};
use crate::billing::{Billing, ConsumeContext};
use crate::config::RelayConfig;
use crate::precheck::pre_check;
use crate::tokens::count_text;

/// Runs one attempt against one channel: admission, upstream round trip,
/// response relay and the billing that follows.
pub struct Pipeline {
    registry: AdaptorRegistry,
    balance: Arc<dyn BalanceService>,
    pricing: Arc<dyn PricingCatalog>,
    billing: Billing,
    pool: Arc<BufferPool>,
    config: Arc<RelayConfig>,
}

struct Forwarded {
    result: Result<(Option<Usage>, StatusCode), RelayError>,
    captured: Vec<u8>,
}

impl Pipeline {
    pub fn new(
        registry: AdaptorRegistry,
        balance: Arc<dyn BalanceService>,
        pricing: Arc<dyn PricingCatalog>,
        recorder: Arc<dyn ConsumptionRecorder>,
        tasks: BillingTasks,
        config: Arc<RelayConfig>,
    ) -> Self {
        let pool = Arc::new(BufferPool::new(
            config.capture_limit,
            config.pool_max_buffers,
        ));
        Self {
            registry,
            balance,
            pricing,
            billing: Billing::new(recorder, tasks),
            pool,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &AdaptorRegistry {
        &self.registry
    }

    pub fn billing_tasks(&self) -> &BillingTasks {
        self.billing.tasks()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    fn charging(&self, meta: &Meta) -> bool {
        self.config.billing_enabled && !meta.health_check
    }

    pub async fn dispatch(
        &self,
        meta: &mut Meta,
        caller: &CallerRequest,
        writer: &mut dyn ResponseWriter,
    ) -> Result<Usage, RelayError> {
        let Some(adaptor) = self.registry.get(meta.channel.kind) else {
            let err = RelayError::adaptor_not_found(meta.channel.kind);
            self.bill_failure(meta, None, &err, caller, &[]);
            return Err(err);
        };

        match self
            .pricing
            .model_price(&meta.origin_model, &meta.actual_model, meta.channel.kind)
        {
            Some(price) => {
                meta.billing_price = price.billing();
                meta.price = price;
            }
            None if self.charging(meta) => {
                let err = RelayError::price_not_found(&meta.origin_model);
                self.bill_failure(meta, None, &err, caller, &[]);
                return Err(err);
            }
            None => {}
        }

        let mut balance = Decimal::ZERO;
        let mut consumer: Option<Box<dyn GroupConsumer>> = None;
        if self.charging(meta) {
            match self.balance.group_remaining_balance(&meta.group).await {
                Ok((remaining, group_consumer)) => {
                    if remaining <= Decimal::ZERO {
                        info!(
                            event = "balance_exhausted",
                            request_id = %meta.request_id,
                            group = %meta.group.id,
                            balance = %remaining
                        );
                        return Err(RelayError::insufficient_balance());
                    }
                    balance = remaining;
                    consumer = Some(group_consumer);
                }
                Err(err) => {
                    error!(
                        event = "get_balance_failed",
                        request_id = %meta.request_id,
                        group = %meta.group.id,
                        error = %err
                    );
                    let err = RelayError::get_balance_failed(err);
                    self.bill_failure(meta, None, &err, caller, &[]);
                    return Err(err);
                }
            }
        }

        let check = match pre_check(meta, caller, self.pricing.as_ref()) {
            Ok(check) => check,
            Err(err) => {
                self.bill_failure(meta, consumer, &err, caller, &[]);
                return Err(err);
            }
        };
        if self.charging(meta) && !admit(&check, balance, meta.health_check) {
            info!(
                event = "admission_rejected",
                request_id = %meta.request_id,
                group = %meta.group.id,
                balance = %balance,
                estimated = %estimated_amount(&check)
            );
            return Err(RelayError::insufficient_balance());
        }

        let started_at = StdInstant::now();
        let forwarded = self.forward(adaptor.as_ref(), meta, caller, writer).await;
        match forwarded.result {
            Ok((usage, status)) => {
                let usage = reconcile_usage(usage, meta.input_tokens);
                debug!(
                    event = "relay_done",
                    request_id = %meta.request_id,
                    channel_id = meta.channel.id,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    elapsed_ms = started_at.elapsed().as_millis()
                );
                if meta.health_check {
                    return Ok(usage);
                }
                let detail = self
                    .config
                    .save_all_log_detail
                    .then(|| self.detail(caller, &forwarded.captured));
                let ctx = ConsumeContext::from_meta(meta, status.as_u16(), usage, "")
                    .with_detail(detail);
                self.billing.spawn_consume(consumer, ctx);
                Ok(usage)
            }
            Err(err) => {
                warn!(
                    event = "relay_failed",
                    request_id = %meta.request_id,
                    channel_id = meta.channel.id,
                    status = err.status.as_u16(),
                    code = %err.code,
                    elapsed_ms = started_at.elapsed().as_millis(),
                    error = %err.message
                );
                self.bill_failure(meta, consumer, &err, caller, &forwarded.captured);
                Err(err)
            }
        }
    }

    async fn forward(
        &self,
        adaptor: &dyn Adaptor,
        meta: &mut Meta,
        caller: &CallerRequest,
        writer: &mut dyn ResponseWriter,
    ) -> Forwarded {
        let deadline = self
            .config
            .timeout(meta.mode)
            .map(|timeout| Instant::now() + timeout);

        let response = match self.round_trip(adaptor, meta, caller, deadline).await {
            Ok(response) => response,
            Err(err) => {
                return Forwarded {
                    result: Err(err),
                    captured: Vec::new(),
                };
            }
        };

        if !response.status.is_success() {
            let err = with_deadline(deadline, adaptor.handle_error(meta, response))
                .await
                .unwrap_or_else(|err| err);
            return Forwarded {
                result: Err(err),
                captured: Vec::new(),
            };
        }

        let mut capture = CaptureWriter::new(writer, self.pool.clone(), self.config.capture_limit);
        let result = with_deadline(deadline, adaptor.do_response(meta, &mut capture, response))
            .await
            .and_then(|result| result)
            .map(|usage| (usage, capture.status().unwrap_or(StatusCode::OK)));
        let keep = result.is_err() || self.config.save_all_log_detail;
        let captured = if keep {
            capture.captured().to_vec()
        } else {
            Vec::new()
        };
        Forwarded { result, captured }
    }

    async fn round_trip(
        &self,
        adaptor: &dyn Adaptor,
        meta: &mut Meta,
        caller: &CallerRequest,
        deadline: Option<Instant>,
    ) -> Result<grelay_relay_core::UpstreamResponse, RelayError> {
        let converted = adaptor.convert_request(meta, caller).await?;
        let url = adaptor.request_url(meta)?;
        let mut outbound = OutboundRequest {
            method: converted.method,
            url,
            headers: converted.headers,
            body: converted.body,
        };
        adaptor.setup_request_header(meta, caller, &mut outbound).await?;
        with_deadline(deadline, adaptor.do_request(meta, caller, &outbound)).await?
    }

    fn detail(&self, caller: &CallerRequest, captured: &[u8]) -> RequestDetail {
        RequestDetail::new(
            &caller.body,
            captured,
            self.config.request_body_max_size,
            self.config.response_body_max_size,
        )
    }

    /// Every decided failure still produces one consumption record, charged
    /// for whatever the caller already received.
    fn bill_failure(
        &self,
        meta: &Meta,
        consumer: Option<Box<dyn GroupConsumer>>,
        err: &RelayError,
        caller: &CallerRequest,
        captured: &[u8],
    ) {
        if meta.health_check {
            return;
        }
        let error_body;
        let response = if captured.is_empty() {
            error_body = err.to_json();
            &error_body[..]
        } else {
            captured
        };
        let ctx = ConsumeContext::from_meta(meta, err.status.as_u16(), partial_usage(meta), &err.message)
            .with_detail(Some(self.detail(caller, response)));
        self.billing.spawn_consume(consumer, ctx);
    }
}

/// Usage relayed before the attempt failed; zero when nothing was.
fn partial_usage(meta: &Meta) -> Usage {
    if let Some(usage) = meta.partial.reported {
        return usage.reconcile(meta.input_tokens);
    }
    if meta.partial.completion_text.is_empty() {
        return Usage::default();
    }
    Usage::new(
        meta.input_tokens,
        count_text(&meta.actual_model, &meta.partial.completion_text),
    )
}

async fn with_deadline<F: Future>(
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, RelayError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| RelayError::upstream_timeout()),
        None => Ok(fut.await),
    }
}
