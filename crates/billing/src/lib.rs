// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::CardDeclined carries provider context
#![allow(clippy::too_many_arguments)] // Some plan-building operations require many parameters
#![allow(clippy::type_complexity)] // Complex return types for provider wrappers
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Autumn Billing Core
//!
//! The billing-plan computation and entitlement-deduction engine that sits
//! between an application and the payment provider.
//!
//! ## Pipeline
//!
//! - **Intent classification**: a mutation request plus current subscription
//!   state resolves to a closed [`intent::BillingIntent`]
//! - **Plan building**: each intent constructs an abstract
//!   [`plan::AutumnPlan`] (record changes) and [`plan::ProviderPlan`]
//!   (provider actions)
//! - **Finalization**: cross-cutting invariants are enforced before execution
//! - **Execution**: durable-store commits first, provider actions second,
//!   idempotent re-entry via metadata records
//!
//! Balance mutations go through the [`deduction`] engine, which handles
//! rollover, replaceable-unit, and prepaid/overage accounting under a
//! per-customer lock.

pub mod builder;
pub mod cache;
pub mod context;
pub mod deduction;
pub mod error;
pub mod execute;
pub mod finalize;
pub mod intent;
pub mod intervals;
pub mod money;
pub mod plan;
pub mod proration;
pub mod provider;
pub mod reconcile;
pub mod rollover;
pub mod service;
pub mod storage;
pub mod stripe_provider;

pub use context::BillingContext;
pub use deduction::{
    DeductionOutcome, DeductionRequest, EntitlementUpdate, OverageBehaviour,
};
pub use error::{BillingError, BillingResult};
pub use intent::{classify, BillingIntent};
pub use plan::{AutumnPlan, BillingPlan, ProviderPlan};
pub use service::BillingService;
