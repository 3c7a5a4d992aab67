//! Invoice computation collaborator.

use crate::models::{BillingPeriod, DraftInvoice, DraftLineItem, Subscription};
use crate::services::repository::SubscriptionStore;
use async_trait::async_trait;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;

/// Produces a priced draft invoice for one subscription period.
#[async_trait]
pub trait InvoiceCalculator: Send + Sync {
    async fn prepare_invoice(
        &self,
        subscription: &Subscription,
        period: BillingPeriod,
    ) -> Result<DraftInvoice, AppError>;
}

/// Prices each recurring line item active at the period start as
/// `quantity * unit_amount`.
pub struct LineItemPricer {
    store: Arc<dyn SubscriptionStore>,
}

impl LineItemPricer {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl InvoiceCalculator for LineItemPricer {
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id, period = %period))]
    async fn prepare_invoice(
        &self,
        subscription: &Subscription,
        period: BillingPeriod,
    ) -> Result<DraftInvoice, AppError> {
        let items = self
            .store
            .list_line_items(subscription.tenant_id, subscription.subscription_id)
            .await?;

        let line_items = items
            .into_iter()
            .filter(|item| item.is_active_at(period.start))
            .map(|item| DraftLineItem {
                price_id: item.price_id,
                amount: (item.quantity * item.unit_amount).round_dp(2),
                description: item.description,
                quantity: item.quantity,
                unit_amount: item.unit_amount,
            })
            .collect();

        Ok(DraftInvoice {
            tenant_id: subscription.tenant_id,
            environment_id: subscription.environment_id,
            subscription_id: subscription.subscription_id,
            customer_id: subscription.customer_id,
            currency: subscription.currency.clone(),
            period_start: period.start,
            period_end: period.end,
            line_items,
        })
    }
}
