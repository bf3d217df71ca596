//! Billing seam: quota checks at admission, usage recording at finalization.
//!
//! Quota policy itself is a collaborator; the gateway only asks "may this
//! user synthesize" before enqueueing and records usage exactly once per
//! successful finalize. Units are `chars(text) * model multiplier`, computed
//! by the result consumer.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Granted,
    Denied,
}

#[async_trait]
pub trait BillingService: Send + Sync {
    async fn check_quota(&self, user_id: &str) -> QuotaDecision;
    async fn record_usage(&self, user_id: &str, model: &str, units: u64);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEntry {
    pub user_id: String,
    pub model: String,
    pub units: u64,
}

/// In-memory billing with an optional flat per-user unit budget.
///
/// Keeps every `record_usage` call, which is what the exactly-once billing
/// tests assert against.
pub struct MemoryBilling {
    budget: Option<u64>,
    used: DashMap<String, u64>,
    entries: Mutex<Vec<UsageEntry>>,
}

impl MemoryBilling {
    pub fn unlimited() -> Self {
        Self { budget: None, used: DashMap::new(), entries: Mutex::new(Vec::new()) }
    }

    pub fn with_budget(units: u64) -> Self {
        Self { budget: Some(units), used: DashMap::new(), entries: Mutex::new(Vec::new()) }
    }

    pub fn entries(&self) -> Vec<UsageEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl BillingService for MemoryBilling {
    async fn check_quota(&self, user_id: &str) -> QuotaDecision {
        match self.budget {
            Some(budget) => {
                let used = self.used.get(user_id).map(|u| *u).unwrap_or(0);
                if used >= budget { QuotaDecision::Denied } else { QuotaDecision::Granted }
            }
            None => QuotaDecision::Granted,
        }
    }

    async fn record_usage(&self, user_id: &str, model: &str, units: u64) {
        *self.used.entry(user_id.to_string()).or_insert(0) += units;
        self.entries.lock().push(UsageEntry {
            user_id: user_id.to_string(),
            model: model.to_string(),
            units,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn budget_denies_once_spent() {
        let billing = MemoryBilling::with_budget(10);
        assert_eq!(billing.check_quota("u1").await, QuotaDecision::Granted);
        billing.record_usage("u1", "m1", 10).await;
        assert_eq!(billing.check_quota("u1").await, QuotaDecision::Denied);
        // Other users keep their own budget.
        assert_eq!(billing.check_quota("u2").await, QuotaDecision::Granted);
    }
}
