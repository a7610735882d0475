pub mod auth;
pub mod rest;

use std::sync::Arc;

use crate::bot::PendingOrders;
use crate::hedge::aggregate::AggregateController;
use crate::hedge::monitor::HedgeSnapshot;

/// Handles shared with the control API.
pub struct ApiState {
    pub aggregate: Arc<AggregateController>,
    pub hedges: HedgeSnapshot,
    pub pending: PendingOrders,
    /// Expected Bearer token; empty rejects every authenticated request.
    pub admin_token: String,
}

impl ApiState {
    pub fn new(
        aggregate: Arc<AggregateController>,
        hedges: HedgeSnapshot,
        pending: PendingOrders,
        admin_token: impl Into<String>,
    ) -> Self {
        Self {
            aggregate,
            hedges,
            pending,
            admin_token: admin_token.into(),
        }
    }
}
