//! Stripe adapter
//!
//! Translates neutral [`ProviderAction`]s into Stripe API calls. Schedule
//! endpoints beyond plain create/update are posted through the raw client,
//! the rest goes through the typed surface. Card declines surface as
//! [`crate::error::BillingError::CardDeclined`] via the error conversion.

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    CancelSubscription, CollectionMethod, CreateCustomer, CreateInvoice, CreateInvoiceItem,
    CreateSubscription, CreateSubscriptionItems, Customer, CustomerId, Invoice, InvoiceId,
    InvoiceItem, Subscription, SubscriptionId, SubscriptionSchedule, SubscriptionStatus,
    UpdateSubscription, UpdateSubscriptionItems,
};

use crate::error::{BillingError, BillingResult};
use crate::money::to_minor_units;
use crate::plan::{LineItem, PlanItem, ProrationFlag, ProviderAction, SchedulePhase};
use crate::provider::{
    PaymentProvider, ProviderActionResult, ProviderInvoice, ProviderInvoiceStatus,
    ProviderSubItem, ProviderSubStatus, ProviderSubscription,
};

pub struct StripeProvider {
    client: stripe::Client,
}

impl StripeProvider {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        Ok(Self::new(&secret_key))
    }
}

fn ms_to_secs(ms: i64) -> i64 {
    ms / 1000
}

fn secs_to_ms(secs: i64) -> i64 {
    secs * 1000
}

fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
    id.parse::<CustomerId>().map_err(|e| BillingError::ProviderApi {
        code: None,
        message: format!("invalid customer id: {e}"),
    })
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse::<SubscriptionId>()
        .map_err(|e| BillingError::ProviderApi {
            code: None,
            message: format!("invalid subscription id: {e}"),
        })
}

fn provider_price_id(item: &PlanItem) -> BillingResult<String> {
    item.price
        .provider_price_id
        .clone()
        .ok_or_else(|| {
            BillingError::Internal(format!(
                "price {} has no provider price id",
                item.price.id
            ))
        })
}

fn proration_param(flag: ProrationFlag) -> SubscriptionProrationBehavior {
    match flag {
        ProrationFlag::CreateProrations => SubscriptionProrationBehavior::CreateProrations,
        ProrationFlag::None => SubscriptionProrationBehavior::None,
        ProrationFlag::AlwaysInvoice => SubscriptionProrationBehavior::AlwaysInvoice,
    }
}

fn map_sub_status(status: SubscriptionStatus) -> ProviderSubStatus {
    match status {
        SubscriptionStatus::Active => ProviderSubStatus::Active,
        SubscriptionStatus::Trialing => ProviderSubStatus::Trialing,
        SubscriptionStatus::PastDue => ProviderSubStatus::PastDue,
        SubscriptionStatus::Unpaid => ProviderSubStatus::Unpaid,
        SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired => {
            ProviderSubStatus::Canceled
        }
        SubscriptionStatus::Incomplete => ProviderSubStatus::Incomplete,
        _ => ProviderSubStatus::Other,
    }
}

fn map_subscription(sub: &Subscription) -> ProviderSubscription {
    ProviderSubscription {
        id: sub.id.to_string(),
        status: map_sub_status(sub.status),
        current_period_start: secs_to_ms(sub.current_period_start),
        current_period_end: secs_to_ms(sub.current_period_end),
        trial_end: sub.trial_end.map(secs_to_ms),
        cancel_at_period_end: sub.cancel_at_period_end,
        items: sub
            .items
            .data
            .iter()
            .map(|item| ProviderSubItem {
                item_id: item.id.to_string(),
                price_id: item
                    .price
                    .as_ref()
                    .map(|p| p.id.to_string())
                    .unwrap_or_default(),
                quantity: item.quantity,
            })
            .collect(),
        schedule_id: sub.schedule.as_ref().map(|s| s.id().to_string()),
    }
}

fn map_invoice(invoice: &Invoice) -> ProviderInvoice {
    let status = match invoice.status {
        Some(stripe::InvoiceStatus::Draft) => ProviderInvoiceStatus::Draft,
        Some(stripe::InvoiceStatus::Open) => ProviderInvoiceStatus::Open,
        Some(stripe::InvoiceStatus::Paid) => ProviderInvoiceStatus::Paid,
        Some(stripe::InvoiceStatus::Void) => ProviderInvoiceStatus::Void,
        _ => ProviderInvoiceStatus::Uncollectible,
    };
    ProviderInvoice {
        id: invoice.id.to_string(),
        status,
        total: invoice.total.unwrap_or(0),
        subscription_id: invoice.subscription.as_ref().map(|s| s.id().to_string()),
    }
}

// Schedule phase endpoints are posted through the raw client; the typed
// phase params don't model the shapes we need
#[derive(serde::Serialize)]
struct SchedulePhaseItemForm {
    price: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    quantity: Option<u64>,
}

#[derive(serde::Serialize)]
struct SchedulePhaseForm {
    items: Vec<SchedulePhaseItemForm>,
    start_date: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_date: Option<i64>,
}

#[derive(serde::Serialize)]
struct CreateScheduleForm<'a> {
    from_subscription: &'a str,
}

#[derive(serde::Serialize)]
struct UpdateScheduleForm {
    phases: Vec<SchedulePhaseForm>,
}

fn schedule_phase_forms(phases: &[SchedulePhase]) -> BillingResult<Vec<SchedulePhaseForm>> {
    phases
        .iter()
        .map(|phase| {
            let items = phase
                .items
                .iter()
                .map(|item| {
                    Ok(SchedulePhaseItemForm {
                        price: provider_price_id(item)?,
                        quantity: item.quantity,
                    })
                })
                .collect::<BillingResult<Vec<_>>>()?;
            Ok(SchedulePhaseForm {
                items,
                start_date: ms_to_secs(phase.start),
                end_date: phase.end.map(ms_to_secs),
            })
        })
        .collect()
}

impl StripeProvider {
    async fn create_subscription(
        &self,
        provider_customer_id: &str,
        items: &[PlanItem],
        trial_end: Option<i64>,
        charge_automatically: bool,
    ) -> BillingResult<ProviderActionResult> {
        let customer_id = parse_customer_id(provider_customer_id)?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(
            items
                .iter()
                .map(|item| {
                    Ok(CreateSubscriptionItems {
                        price: Some(provider_price_id(item)?),
                        quantity: item.quantity,
                        ..Default::default()
                    })
                })
                .collect::<BillingResult<Vec<_>>>()?,
        );
        if let Some(trial_end) = trial_end {
            params.trial_end = Some(stripe::Scheduled::at(ms_to_secs(trial_end)));
        }
        params.collection_method = Some(if charge_automatically {
            CollectionMethod::ChargeAutomatically
        } else {
            CollectionMethod::SendInvoice
        });

        let sub = Subscription::create(&self.client, params).await?;
        tracing::info!(subscription_id = %sub.id, "created provider subscription");
        Ok(ProviderActionResult::Subscription(map_subscription(&sub)))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        items: &[PlanItem],
        proration: ProrationFlag,
        trial_end: Option<i64>,
        cancel_at_period_end: Option<bool>,
    ) -> BillingResult<ProviderActionResult> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let mut update_items = Vec::new();
        if !items.is_empty() {
            let current = Subscription::retrieve(&self.client, &sub_id, &[]).await?;

            // Retained prices keep their item id; items absent from the plan
            // are deleted
            for item in items {
                let price_id = provider_price_id(item)?;
                let existing = current.items.data.iter().find(|si| {
                    si.price
                        .as_ref()
                        .map(|p| p.id.as_str() == price_id)
                        .unwrap_or(false)
                });
                update_items.push(UpdateSubscriptionItems {
                    id: existing.map(|si| si.id.to_string()),
                    price: Some(price_id),
                    quantity: item.quantity,
                    ..Default::default()
                });
            }
            for existing in &current.items.data {
                let retained = existing
                    .price
                    .as_ref()
                    .map(|p| {
                        items.iter().any(|item| {
                            item.price.provider_price_id.as_deref() == Some(p.id.as_str())
                        })
                    })
                    .unwrap_or(false);
                if !retained {
                    update_items.push(UpdateSubscriptionItems {
                        id: Some(existing.id.to_string()),
                        deleted: Some(true),
                        ..Default::default()
                    });
                }
            }
        }

        let mut params = UpdateSubscription::new();
        if !update_items.is_empty() {
            params.items = Some(update_items);
        }
        params.proration_behavior = Some(proration_param(proration));
        if let Some(trial_end) = trial_end {
            params.trial_end = Some(stripe::Scheduled::at(ms_to_secs(trial_end)));
        }
        params.cancel_at_period_end = cancel_at_period_end;

        let sub = Subscription::update(&self.client, &sub_id, params).await?;
        Ok(ProviderActionResult::Subscription(map_subscription(&sub)))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        invoice_now: bool,
        prorate: bool,
    ) -> BillingResult<ProviderActionResult> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: Some(invoice_now),
            prorate: Some(prorate),
        };
        let sub = Subscription::cancel(&self.client, &sub_id, params).await?;
        tracing::info!(subscription_id = %sub.id, "canceled provider subscription");
        Ok(ProviderActionResult::Subscription(map_subscription(&sub)))
    }

    async fn create_invoice(
        &self,
        provider_customer_id: &str,
        lines: &[LineItem],
        finalize_and_pay: bool,
    ) -> BillingResult<ProviderActionResult> {
        let customer_id = parse_customer_id(provider_customer_id)?;

        for line in lines {
            let mut item_params = CreateInvoiceItem::new(customer_id.clone());
            item_params.amount = Some(to_minor_units(line.amount));
            item_params.currency = Some(stripe::Currency::USD);
            item_params.description = Some(&line.description);
            InvoiceItem::create(&self.client, item_params).await?;
        }

        let mut invoice_params = CreateInvoice::new();
        invoice_params.customer = Some(customer_id);
        invoice_params.auto_advance = Some(finalize_and_pay);
        invoice_params.collection_method = Some(CollectionMethod::ChargeAutomatically);

        let invoice = Invoice::create(&self.client, invoice_params).await?;

        let invoice = if finalize_and_pay {
            let invoice_id =
                invoice
                    .id
                    .as_str()
                    .parse::<InvoiceId>()
                    .map_err(|e| BillingError::ProviderApi {
                        code: None,
                        message: format!("invalid invoice id: {e}"),
                    })?;
            Invoice::finalize(&self.client, &invoice_id, Default::default()).await?
        } else {
            invoice
        };
        Ok(ProviderActionResult::Invoice(map_invoice(&invoice)))
    }

    async fn update_schedule(
        &self,
        schedule_id: Option<&str>,
        subscription_id: &str,
        phases: &[SchedulePhase],
    ) -> BillingResult<ProviderActionResult> {
        let schedule_id = match schedule_id {
            Some(id) => id.to_string(),
            None => {
                let schedule: SubscriptionSchedule = self
                    .client
                    .post_form(
                        "/subscription_schedules",
                        CreateScheduleForm {
                            from_subscription: subscription_id,
                        },
                    )
                    .await?;
                schedule.id.to_string()
            }
        };

        let form = UpdateScheduleForm {
            phases: schedule_phase_forms(phases)?,
        };
        let schedule: SubscriptionSchedule = self
            .client
            .post_form(&format!("/subscription_schedules/{schedule_id}"), form)
            .await?;
        tracing::info!(schedule_id = %schedule.id, "updated subscription schedule");
        Ok(ProviderActionResult::Schedule {
            id: schedule.id.to_string(),
        })
    }

    async fn release_schedule(&self, schedule_id: &str) -> BillingResult<ProviderActionResult> {
        let _: SubscriptionSchedule = self
            .client
            .post(&format!("/subscription_schedules/{schedule_id}/release"))
            .await?;
        Ok(ProviderActionResult::Released)
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn ensure_customer(&self, customer_id: &str) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("autumn_customer_id".to_string(), customer_id.to_string());

        let params = CreateCustomer {
            metadata: Some(metadata),
            ..Default::default()
        };
        let customer = Customer::create(&self.client, params).await?;
        tracing::info!(
            customer_id = %customer_id,
            provider_customer_id = %customer.id,
            "created provider customer"
        );
        Ok(customer.id.to_string())
    }

    async fn apply(
        &self,
        provider_customer_id: &str,
        action: &ProviderAction,
    ) -> BillingResult<ProviderActionResult> {
        match action {
            ProviderAction::CreateSubscription {
                items,
                trial_end,
                charge_automatically,
            } => {
                self.create_subscription(
                    provider_customer_id,
                    items,
                    *trial_end,
                    *charge_automatically,
                )
                .await
            }
            ProviderAction::UpdateSubscription {
                subscription_id,
                items,
                proration,
                trial_end,
                cancel_at_period_end,
            } => {
                self.update_subscription(
                    subscription_id,
                    items,
                    *proration,
                    *trial_end,
                    *cancel_at_period_end,
                )
                .await
            }
            ProviderAction::CancelSubscription {
                subscription_id,
                invoice_now,
                prorate,
            } => {
                self.cancel_subscription(subscription_id, *invoice_now, *prorate)
                    .await
            }
            ProviderAction::CreateInvoice {
                lines,
                finalize_and_pay,
            } => {
                self.create_invoice(provider_customer_id, lines, *finalize_and_pay)
                    .await
            }
            ProviderAction::UpdateSchedule {
                schedule_id,
                subscription_id,
                phases,
            } => {
                self.update_schedule(schedule_id.as_deref(), subscription_id, phases)
                    .await
            }
            ProviderAction::ReleaseSchedule { schedule_id } => {
                self.release_schedule(schedule_id).await
            }
        }
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let sub = Subscription::retrieve(&self.client, &sub_id, &[]).await?;
        Ok(map_subscription(&sub))
    }

    async fn get_invoice(&self, invoice_id: &str) -> BillingResult<ProviderInvoice> {
        let id = invoice_id
            .parse::<InvoiceId>()
            .map_err(|e| BillingError::ProviderApi {
                code: None,
                message: format!("invalid invoice id: {e}"),
            })?;
        let invoice = Invoice::retrieve(&self.client, &id, &[]).await?;
        Ok(map_invoice(&invoice))
    }
}
