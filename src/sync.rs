use crate::cache::MarkerCache;
use crate::credentials::{CredentialResolver, CredentialSet};
use crate::meli::{AccountSiblings, MarketplaceApi, MeliError, MeliErrorKind};
use crate::models::{FetchedOrder, OrderLineItem, PersistedOrder, PersistedOrderItem, QuantityChange};
use crate::queue::{OrderQueue, QueuedMessage};
use crate::store::OrderStore;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};
use uuid::Uuid;

/// A run is a hard failure once this share of the order's items could not
/// be reconciled.
const FAILURE_THRESHOLD: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// Expected to succeed on queue redelivery.
    Transient,
    Fatal,
}

/// Terminal error for one processing run. The message is never
/// acknowledged when this surfaces; the queue will redeliver it.
#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct SyncError {
    stage: &'static str,
    kind: SyncErrorKind,
    message: String,
}

impl SyncError {
    fn transient(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: SyncErrorKind::Transient,
            message: message.into(),
        }
    }

    fn fatal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: SyncErrorKind::Fatal,
            message: message.into(),
        }
    }

    fn from_meli(stage: &'static str, err: MeliError) -> Self {
        match err.kind() {
            MeliErrorKind::Transient => Self::transient(stage, err.to_string()),
            MeliErrorKind::Permanent => Self::fatal(stage, err.to_string()),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> SyncErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// Terminal state of one successfully handled message.
#[derive(Debug)]
pub enum SyncReport {
    /// Duplicate notification; acknowledged without side effects.
    Skipped { order_id: String },
    Completed {
        order_id: String,
        updated: usize,
    },
    /// Below-threshold partial failure: recorded and acknowledged, the
    /// listed changes were not applied.
    SoftFailed {
        order_id: String,
        unsynced: Vec<QuantityChange>,
    },
}

/// A quantity change routed to the account that owns the sibling.
#[derive(Debug)]
struct PlannedUpdate {
    account_id: String,
    change: QuantityChange,
}

enum UpdateOutcome {
    Applied,
    Transient(PlannedUpdate),
    Failed(PlannedUpdate),
}

struct UpdateSummary {
    applied: usize,
    failed: Vec<QuantityChange>,
}

pub struct OrderSyncService {
    queue: Arc<dyn OrderQueue>,
    marketplace: Arc<dyn MarketplaceApi>,
    credentials: Arc<dyn CredentialResolver>,
    store: Arc<dyn OrderStore>,
    cache: Arc<dyn MarkerCache>,
}

impl OrderSyncService {
    pub fn new(
        queue: Arc<dyn OrderQueue>,
        marketplace: Arc<dyn MarketplaceApi>,
        credentials: Arc<dyn CredentialResolver>,
        store: Arc<dyn OrderStore>,
        cache: Arc<dyn MarkerCache>,
    ) -> Self {
        Self {
            queue,
            marketplace,
            credentials,
            store,
            cache,
        }
    }

    /// Run the full pipeline for one dequeued message:
    /// duplicate check, credential lookup, order fetch, reconciliation,
    /// quantity updates, durable record, marker, acknowledgment.
    pub async fn process_message(&self, message: &QueuedMessage) -> Result<SyncReport, SyncError> {
        if self.already_processed(&message.order_id).await? {
            info!(
                target = "stocksync.sync",
                order_id = %message.order_id,
                "order already processed, skipping"
            );
            self.acknowledge(message).await;
            return Ok(SyncReport::Skipped {
                order_id: message.order_id.clone(),
            });
        }

        let credentials = self
            .credentials
            .for_account(&message.account_id)
            .await
            .map_err(|err| {
                error!(
                    target = "stocksync.sync",
                    order_id = %message.order_id,
                    account_id = %message.account_id,
                    error = %err,
                    "failed to resolve seller credentials"
                );
                SyncError::fatal("resolve_credentials", err.to_string())
            })?;

        let order = self
            .marketplace
            .fetch_order(&message.order_id, &credentials.owner.access_token)
            .await
            .map_err(|err| {
                error!(
                    target = "stocksync.sync",
                    order_id = %message.order_id,
                    error = %err,
                    "failed to fetch the order"
                );
                SyncError::from_meli("fetch_order", err)
            })?;

        // Listings on the order itself were already decremented by the
        // marketplace and must not be touched again.
        let excluded: HashSet<String> = order
            .items
            .iter()
            .map(|item| item.listing_id.clone())
            .collect();
        let merged = merge_line_items(&order.items);

        let planned = self
            .plan_updates(&order.order_id, &merged, &excluded, &credentials)
            .await?;
        let summary = self
            .apply_updates(planned, &credentials, order.items.len())
            .await?;

        let record = build_record(&order, &merged, credentials.owner.store_id);
        self.store.put(&record).await.map_err(|err| {
            error!(
                target = "stocksync.sync",
                order_id = %order.order_id,
                error = %err,
                "failed to store the order"
            );
            SyncError::fatal("persist_order", err.to_string())
        })?;

        if let Err(err) = self.cache.put(&order.order_id, order.status).await {
            warn!(
                target = "stocksync.sync",
                order_id = %order.order_id,
                error = %err,
                "failed to write the idempotency marker"
            );
        }

        self.acknowledge(message).await;

        if summary.failed.is_empty() {
            info!(
                target = "stocksync.sync",
                order_id = %order.order_id,
                updated = summary.applied,
                "order synchronized"
            );
            Ok(SyncReport::Completed {
                order_id: order.order_id,
                updated: summary.applied,
            })
        } else {
            crate::metrics::unsynced_listings(summary.failed.len());
            Ok(SyncReport::SoftFailed {
                order_id: order.order_id,
                unsynced: summary.failed,
            })
        }
    }

    /// Two-tier duplicate check: ephemeral marker first (fail-open),
    /// durable record second (fail-closed).
    async fn already_processed(&self, order_id: &str) -> Result<bool, SyncError> {
        if self.cache.get(order_id).await {
            return Ok(true);
        }
        match self.store.get(order_id).await {
            Ok(record) => Ok(record.is_some()),
            Err(err) => {
                error!(
                    target = "stocksync.sync",
                    order_id = order_id,
                    error = %err,
                    "failed to check the durable order record"
                );
                Err(SyncError::transient("duplicate_check", err.to_string()))
            }
        }
    }

    async fn acknowledge(&self, message: &QueuedMessage) {
        if let Err(err) = self.queue.acknowledge(&message.receipt).await {
            warn!(
                target = "stocksync.sync",
                order_id = %message.order_id,
                error = %err,
                "failed to delete the notification from the queue"
            );
        }
    }

    /// Expand merged line items into per-sibling quantity changes.
    async fn plan_updates(
        &self,
        order_id: &str,
        merged: &[OrderLineItem],
        excluded: &HashSet<String>,
        credentials: &CredentialSet,
    ) -> Result<Vec<PlannedUpdate>, SyncError> {
        let mut planned = Vec::new();
        for item in merged {
            if item.sku.is_empty() {
                warn!(
                    target = "stocksync.sync",
                    order_id = order_id,
                    listing_id = %item.listing_id,
                    "order item has no sku, clones cannot be located"
                );
                continue;
            }
            let accounts = self
                .lookup_siblings(order_id, &item.sku, credentials)
                .await?;
            for AccountSiblings {
                account_id,
                listings,
            } in accounts
            {
                for sibling in listings {
                    if excluded.contains(&sibling.listing_id) {
                        continue;
                    }
                    planned.push(PlannedUpdate {
                        account_id: account_id.clone(),
                        change: QuantityChange {
                            listing_id: sibling.listing_id,
                            title: sibling.title,
                            sku: sibling.sku,
                            new_quantity: sibling.available_quantity - item.quantity,
                        },
                    });
                }
            }
        }
        Ok(planned)
    }

    /// Clone lookup with one bounded retry on transient failure. A second
    /// failure aborts the whole run.
    async fn lookup_siblings(
        &self,
        order_id: &str,
        sku: &str,
        credentials: &CredentialSet,
    ) -> Result<Vec<AccountSiblings>, SyncError> {
        match self.marketplace.find_by_sku(sku, credentials).await {
            Ok(found) => Ok(found),
            Err(err) if err.is_transient() => {
                warn!(
                    target = "stocksync.sync",
                    order_id = order_id,
                    sku = sku,
                    error = %err,
                    "clone lookup failed, retrying once"
                );
                sleep(retry_delay()).await;
                self.marketplace
                    .find_by_sku(sku, credentials)
                    .await
                    .map_err(|retry_err| {
                        error!(
                            target = "stocksync.sync",
                            order_id = order_id,
                            sku = sku,
                            error = %retry_err,
                            "clone lookup retry failed"
                        );
                        SyncError::from_meli("find_clones", retry_err)
                    })
            }
            Err(err) => {
                error!(
                    target = "stocksync.sync",
                    order_id = order_id,
                    sku = sku,
                    error = %err,
                    "clone lookup failed"
                );
                Err(SyncError::from_meli("find_clones", err))
            }
        }
    }

    /// Two-pass application with terminal triage: transient failures get
    /// exactly one more attempt, then everything left is judged against
    /// the failure threshold.
    async fn apply_updates(
        &self,
        planned: Vec<PlannedUpdate>,
        credentials: &CredentialSet,
        original_item_count: usize,
    ) -> Result<UpdateSummary, SyncError> {
        let total = planned.len();
        let mut pending = Vec::new();
        let mut failed = Vec::new();

        for update in planned {
            match self.apply_one(update, credentials).await {
                UpdateOutcome::Applied => {}
                UpdateOutcome::Transient(update) => pending.push(update),
                UpdateOutcome::Failed(update) => failed.push(update),
            }
        }

        if !pending.is_empty() {
            sleep(retry_delay()).await;
            for update in pending {
                match self.apply_one(update, credentials).await {
                    UpdateOutcome::Applied => {}
                    UpdateOutcome::Transient(update) | UpdateOutcome::Failed(update) => {
                        failed.push(update)
                    }
                }
            }
        }

        let failed: Vec<QuantityChange> = failed.into_iter().map(|update| update.change).collect();
        if !failed.is_empty() {
            let ratio = failed.len() as f64 / original_item_count.max(1) as f64;
            if ratio >= FAILURE_THRESHOLD {
                let listings: Vec<&str> = failed
                    .iter()
                    .map(|change| change.listing_id.as_str())
                    .collect();
                return Err(SyncError::fatal(
                    "sync_quantities",
                    format!(
                        "{} of {} order items unreconciled: {}",
                        failed.len(),
                        original_item_count,
                        listings.join(", ")
                    ),
                ));
            }
            for change in &failed {
                warn!(
                    target = "stocksync.sync",
                    listing_id = %change.listing_id,
                    title = %change.title,
                    sku = %change.sku,
                    new_quantity = change.new_quantity,
                    "listing left unreconciled below the failure threshold"
                );
            }
        }
        Ok(UpdateSummary {
            applied: total - failed.len(),
            failed,
        })
    }

    async fn apply_one(&self, update: PlannedUpdate, credentials: &CredentialSet) -> UpdateOutcome {
        let Some(credential) = credentials.for_account(&update.account_id) else {
            warn!(
                target = "stocksync.sync",
                listing_id = %update.change.listing_id,
                account_id = %update.account_id,
                "no credential for the sibling's account"
            );
            return UpdateOutcome::Failed(update);
        };
        match self
            .marketplace
            .update_quantity(
                &update.change.listing_id,
                update.change.new_quantity,
                &credential.access_token,
            )
            .await
        {
            Ok(()) => UpdateOutcome::Applied,
            Err(err) if err.is_transient() => {
                warn!(
                    target = "stocksync.sync",
                    listing_id = %update.change.listing_id,
                    sku = %update.change.sku,
                    error = %err,
                    "quantity update failed, will retry"
                );
                UpdateOutcome::Transient(update)
            }
            Err(err) => {
                error!(
                    target = "stocksync.sync",
                    listing_id = %update.change.listing_id,
                    sku = %update.change.sku,
                    error = %err,
                    "quantity update failed"
                );
                UpdateOutcome::Failed(update)
            }
        }
    }
}

/// Collapse line items sharing a non-empty SKU into one entry with the
/// summed quantity, keeping first-seen order. Items without a SKU are
/// kept as individual entries.
fn merge_line_items(items: &[OrderLineItem]) -> Vec<OrderLineItem> {
    let mut merged: Vec<OrderLineItem> = Vec::with_capacity(items.len());
    let mut index_by_sku: HashMap<String, usize> = HashMap::new();
    for item in items {
        if !item.sku.is_empty() {
            if let Some(&at) = index_by_sku.get(&item.sku) {
                merged[at].quantity += item.quantity;
                continue;
            }
            index_by_sku.insert(item.sku.clone(), merged.len());
        }
        merged.push(item.clone());
    }
    merged
}

fn build_record(order: &FetchedOrder, items: &[OrderLineItem], store_id: Uuid) -> PersistedOrder {
    PersistedOrder {
        id: Uuid::new_v4(),
        marketplace_id: order.order_id.clone(),
        store_id,
        created_at: order.created_at,
        status: order.status,
        items: items
            .iter()
            .map(|item| PersistedOrderItem {
                title: item.title.clone(),
                quantity: item.quantity,
                sku: item.sku.clone(),
            })
            .collect(),
    }
}

fn retry_delay() -> Duration {
    let base = std::env::var("RETRY_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(500);
    let jitter = SmallRng::from_os_rng().random_range(0..250u64);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use crate::credentials::{Credential, CredentialError};
    use crate::models::{OrderNotification, OrderStatus, SiblingListing};
    use crate::queue::{QueueError, ReceiptHandle};
    use crate::store::StoreError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingQueue {
        acked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OrderQueue for RecordingQueue {
        async fn publish(&self, _notification: &OrderNotification) -> Result<(), QueueError> {
            Ok(())
        }

        async fn receive(&self) -> Vec<QueuedMessage> {
            Vec::new()
        }

        async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
            self.acked
                .lock()
                .unwrap()
                .push(receipt.as_str().to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCache {
        seen: bool,
        fail_put: bool,
        puts: Mutex<Vec<(String, &'static str)>>,
    }

    #[async_trait]
    impl MarkerCache for FakeCache {
        async fn get(&self, _order_id: &str) -> bool {
            self.seen
        }

        async fn put(&self, order_id: &str, status: OrderStatus) -> Result<(), CacheError> {
            if self.fail_put {
                return Err(CacheError::Write("cache down".to_string()));
            }
            self.puts
                .lock()
                .unwrap()
                .push((order_id.to_string(), status.as_str()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        existing: Option<PersistedOrder>,
        fail_get: bool,
        fail_put: bool,
        puts: Mutex<Vec<PersistedOrder>>,
    }

    #[async_trait]
    impl OrderStore for FakeStore {
        async fn get(&self, marketplace_id: &str) -> Result<Option<PersistedOrder>, StoreError> {
            if self.fail_get {
                return Err(StoreError::Request("db down".to_string()));
            }
            Ok(self
                .existing
                .clone()
                .into_iter()
                .chain(self.puts.lock().unwrap().iter().cloned())
                .find(|order| order.marketplace_id == marketplace_id))
        }

        async fn put(&self, order: &PersistedOrder) -> Result<(), StoreError> {
            if self.fail_put {
                return Err(StoreError::Request("db down".to_string()));
            }
            self.puts.lock().unwrap().push(order.clone());
            Ok(())
        }
    }

    struct FakeResolver {
        set: CredentialSet,
    }

    #[async_trait]
    impl CredentialResolver for FakeResolver {
        async fn for_account(
            &self,
            _account_user_id: &str,
        ) -> Result<CredentialSet, CredentialError> {
            Ok(self.set.clone())
        }
    }

    #[derive(Default)]
    struct FakeMarketplace {
        order: Option<FetchedOrder>,
        siblings: HashMap<String, Vec<AccountSiblings>>,
        lookup_failures: Mutex<HashMap<String, Vec<MeliError>>>,
        update_failures: Mutex<HashMap<String, Vec<MeliError>>>,
        lookup_calls: Mutex<Vec<String>>,
        update_calls: Mutex<Vec<(String, i32)>>,
    }

    #[async_trait]
    impl MarketplaceApi for FakeMarketplace {
        async fn fetch_order(
            &self,
            _order_id: &str,
            _access_token: &str,
        ) -> Result<FetchedOrder, MeliError> {
            self.order
                .clone()
                .ok_or_else(|| MeliError::permanent("no order scripted"))
        }

        async fn find_by_sku(
            &self,
            sku: &str,
            _credentials: &CredentialSet,
        ) -> Result<Vec<AccountSiblings>, MeliError> {
            self.lookup_calls.lock().unwrap().push(sku.to_string());
            if let Some(failures) = self.lookup_failures.lock().unwrap().get_mut(sku)
                && !failures.is_empty()
            {
                return Err(failures.remove(0));
            }
            Ok(self.siblings.get(sku).cloned().unwrap_or_default())
        }

        async fn update_quantity(
            &self,
            listing_id: &str,
            quantity: i32,
            _access_token: &str,
        ) -> Result<(), MeliError> {
            self.update_calls
                .lock()
                .unwrap()
                .push((listing_id.to_string(), quantity));
            if let Some(failures) = self.update_failures.lock().unwrap().get_mut(listing_id)
                && !failures.is_empty()
            {
                return Err(failures.remove(0));
            }
            Ok(())
        }
    }

    struct Harness {
        queue: Arc<RecordingQueue>,
        cache: Arc<FakeCache>,
        store: Arc<FakeStore>,
        marketplace: Arc<FakeMarketplace>,
        service: OrderSyncService,
    }

    fn harness(cache: FakeCache, store: FakeStore, marketplace: FakeMarketplace) -> Harness {
        let queue = Arc::new(RecordingQueue::default());
        let cache = Arc::new(cache);
        let store = Arc::new(store);
        let marketplace = Arc::new(marketplace);
        let service = OrderSyncService::new(
            queue.clone(),
            marketplace.clone(),
            Arc::new(FakeResolver {
                set: credential_set(),
            }),
            store.clone(),
            cache.clone(),
        );
        Harness {
            queue,
            cache,
            store,
            marketplace,
            service,
        }
    }

    fn credential(account_id: &str) -> Credential {
        Credential {
            store_id: Uuid::nil(),
            account_id: account_id.to_string(),
            access_token: format!("token-{account_id}"),
            refresh_token: format!("refresh-{account_id}"),
            expires_at: Utc::now() + chrono::Duration::hours(6),
        }
    }

    fn credential_set() -> CredentialSet {
        let owner = credential("100");
        let second = credential("200");
        CredentialSet {
            owner: owner.clone(),
            all: vec![owner, second],
        }
    }

    fn line(listing_id: &str, sku: &str, quantity: i32) -> OrderLineItem {
        OrderLineItem {
            listing_id: listing_id.to_string(),
            title: format!("Listing {listing_id}"),
            sku: sku.to_string(),
            quantity,
        }
    }

    fn sibling(listing_id: &str, sku: &str, available_quantity: i32) -> SiblingListing {
        SiblingListing {
            listing_id: listing_id.to_string(),
            title: format!("Listing {listing_id}"),
            sku: sku.to_string(),
            available_quantity,
        }
    }

    fn account(account_id: &str, listings: Vec<SiblingListing>) -> AccountSiblings {
        AccountSiblings {
            account_id: account_id.to_string(),
            listings,
        }
    }

    fn order_with(items: Vec<OrderLineItem>) -> FetchedOrder {
        FetchedOrder {
            order_id: "2000001".to_string(),
            created_at: Utc::now(),
            status: OrderStatus::Paid,
            items,
        }
    }

    fn message() -> QueuedMessage {
        QueuedMessage {
            account_id: "100".to_string(),
            order_id: "2000001".to_string(),
            attempts: 1,
            receipt: ReceiptHandle::new("receipt-1"),
        }
    }

    fn persisted(marketplace_id: &str) -> PersistedOrder {
        PersistedOrder {
            id: Uuid::new_v4(),
            marketplace_id: marketplace_id.to_string(),
            store_id: Uuid::nil(),
            created_at: Utc::now(),
            status: OrderStatus::Paid,
            items: Vec::new(),
        }
    }

    #[test]
    fn merge_sums_quantities_by_sku() {
        let merged = merge_line_items(&[
            line("L1", "A", 2),
            line("L2", "A", 3),
            line("L3", "B", 1),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].sku, "A");
        assert_eq!(merged[0].quantity, 5);
        assert_eq!(merged[0].listing_id, "L1");
        assert_eq!(merged[1].sku, "B");
        assert_eq!(merged[1].quantity, 1);
    }

    #[test]
    fn merge_keeps_empty_sku_items_separate() {
        let merged = merge_line_items(&[line("L1", "", 1), line("L2", "", 2)]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].quantity, 1);
        assert_eq!(merged[1].quantity, 2);
    }

    #[tokio::test]
    async fn marker_hit_skips_and_acknowledges() {
        let h = harness(
            FakeCache {
                seen: true,
                ..FakeCache::default()
            },
            FakeStore::default(),
            FakeMarketplace::default(),
        );
        let report = h.service.process_message(&message()).await.expect("report");
        assert!(matches!(report, SyncReport::Skipped { .. }));
        assert!(h.marketplace.lookup_calls.lock().unwrap().is_empty());
        assert!(h.marketplace.update_calls.lock().unwrap().is_empty());
        assert_eq!(*h.queue.acked.lock().unwrap(), vec!["receipt-1"]);
    }

    #[tokio::test]
    async fn durable_record_skips_and_acknowledges() {
        let h = harness(
            FakeCache::default(),
            FakeStore {
                existing: Some(persisted("2000001")),
                ..FakeStore::default()
            },
            FakeMarketplace::default(),
        );
        let report = h.service.process_message(&message()).await.expect("report");
        assert!(matches!(report, SyncReport::Skipped { .. }));
        assert!(h.marketplace.update_calls.lock().unwrap().is_empty());
        assert_eq!(h.queue.acked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn durable_lookup_error_fails_closed() {
        let h = harness(
            FakeCache::default(),
            FakeStore {
                fail_get: true,
                ..FakeStore::default()
            },
            FakeMarketplace::default(),
        );
        let err = h
            .service
            .process_message(&message())
            .await
            .expect_err("should fail");
        assert_eq!(err.stage(), "duplicate_check");
        assert!(h.queue.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn own_listing_excluded_sibling_decremented() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "S1", 1)]));
        marketplace.siblings.insert(
            "S1".to_string(),
            vec![account(
                "100",
                vec![sibling("L1", "S1", 10), sibling("L2", "S1", 10)],
            )],
        );
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        let report = h.service.process_message(&message()).await.expect("report");
        assert!(matches!(report, SyncReport::Completed { updated: 1, .. }));
        assert_eq!(
            *h.marketplace.update_calls.lock().unwrap(),
            vec![("L2".to_string(), 9)]
        );

        let puts = h.store.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].marketplace_id, "2000001");
        assert_eq!(puts[0].items.len(), 1);
        assert_eq!(puts[0].items[0].sku, "S1");

        let markers = h.cache.puts.lock().unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0], ("2000001".to_string(), "paid"));
        assert_eq!(*h.queue.acked.lock().unwrap(), vec!["receipt-1"]);
    }

    #[tokio::test]
    async fn duplicate_lines_merge_before_lookup() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![
            line("L1", "A", 2),
            line("L1", "A", 3),
            line("L2", "B", 1),
        ]));
        marketplace
            .siblings
            .insert("A".to_string(), vec![account("100", vec![sibling("C1", "A", 20)])]);
        marketplace
            .siblings
            .insert("B".to_string(), vec![account("100", vec![sibling("C2", "B", 7)])]);
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        h.service.process_message(&message()).await.expect("report");
        assert_eq!(
            *h.marketplace.lookup_calls.lock().unwrap(),
            vec!["A".to_string(), "B".to_string()]
        );
        assert_eq!(
            *h.marketplace.update_calls.lock().unwrap(),
            vec![("C1".to_string(), 15), ("C2".to_string(), 6)]
        );
    }

    #[tokio::test]
    async fn empty_sku_items_are_skipped_but_recorded() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "", 1)]));
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        let report = h.service.process_message(&message()).await.expect("report");
        assert!(matches!(report, SyncReport::Completed { updated: 0, .. }));
        assert!(h.marketplace.lookup_calls.lock().unwrap().is_empty());

        let puts = h.store.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].items.len(), 1);
        assert_eq!(puts[0].items[0].sku, "");
    }

    #[tokio::test]
    async fn lookup_transient_failure_retries_once_then_succeeds() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "S1", 1)]));
        marketplace
            .siblings
            .insert("S1".to_string(), vec![account("100", vec![sibling("L2", "S1", 10)])]);
        marketplace
            .lookup_failures
            .lock()
            .unwrap()
            .insert("S1".to_string(), vec![MeliError::transient("timeout")]);
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        let report = h.service.process_message(&message()).await.expect("report");
        assert!(matches!(report, SyncReport::Completed { updated: 1, .. }));
        assert_eq!(h.marketplace.lookup_calls.lock().unwrap().len(), 2);
        assert_eq!(
            *h.marketplace.update_calls.lock().unwrap(),
            vec![("L2".to_string(), 9)]
        );
    }

    #[tokio::test]
    async fn lookup_retry_exhausted_aborts_run() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "S1", 1)]));
        marketplace.lookup_failures.lock().unwrap().insert(
            "S1".to_string(),
            vec![
                MeliError::transient("timeout"),
                MeliError::transient("timeout"),
            ],
        );
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        let err = h
            .service
            .process_message(&message())
            .await
            .expect_err("should abort");
        assert_eq!(err.stage(), "find_clones");
        assert_eq!(err.kind(), SyncErrorKind::Transient);
        assert_eq!(h.marketplace.lookup_calls.lock().unwrap().len(), 2);
        assert!(h.marketplace.update_calls.lock().unwrap().is_empty());
        assert!(h.store.puts.lock().unwrap().is_empty());
        assert!(h.queue.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_permanent_failure_aborts_without_retry() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "S1", 1)]));
        marketplace
            .lookup_failures
            .lock()
            .unwrap()
            .insert("S1".to_string(), vec![MeliError::permanent("bad sku")]);
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        let err = h
            .service
            .process_message(&message())
            .await
            .expect_err("should abort");
        assert_eq!(err.stage(), "find_clones");
        assert_eq!(err.kind(), SyncErrorKind::Fatal);
        assert_eq!(h.marketplace.lookup_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_transient_failure_is_retried_once() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "S1", 1)]));
        marketplace
            .siblings
            .insert("S1".to_string(), vec![account("100", vec![sibling("C1", "S1", 10)])]);
        marketplace
            .update_failures
            .lock()
            .unwrap()
            .insert("C1".to_string(), vec![MeliError::transient("rate limited")]);
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        let report = h.service.process_message(&message()).await.expect("report");
        assert!(matches!(report, SyncReport::Completed { updated: 1, .. }));
        assert_eq!(
            *h.marketplace.update_calls.lock().unwrap(),
            vec![("C1".to_string(), 9), ("C1".to_string(), 9)]
        );
    }

    // 1 failed listing out of 5 order items sits exactly on the 20%
    // boundary and must hard-fail.
    #[tokio::test]
    async fn failure_at_threshold_boundary_hard_fails() {
        let mut marketplace = FakeMarketplace::default();
        let items: Vec<OrderLineItem> = (1..=5)
            .map(|i| line(&format!("L{i}"), &format!("S{i}"), 1))
            .collect();
        marketplace.order = Some(order_with(items));
        for i in 1..=5 {
            marketplace.siblings.insert(
                format!("S{i}"),
                vec![account("100", vec![sibling(&format!("C{i}"), &format!("S{i}"), 10)])],
            );
        }
        marketplace
            .update_failures
            .lock()
            .unwrap()
            .insert("C1".to_string(), vec![MeliError::permanent("gone")]);
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        let err = h
            .service
            .process_message(&message())
            .await
            .expect_err("should hard fail");
        assert_eq!(err.stage(), "sync_quantities");
        assert!(err.detail().contains("C1"));
        assert!(h.store.puts.lock().unwrap().is_empty());
        assert!(h.cache.puts.lock().unwrap().is_empty());
        assert!(h.queue.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_below_threshold_soft_fails_and_acknowledges() {
        let mut marketplace = FakeMarketplace::default();
        let items: Vec<OrderLineItem> = (1..=6)
            .map(|i| line(&format!("L{i}"), &format!("S{i}"), 1))
            .collect();
        marketplace.order = Some(order_with(items));
        for i in 1..=6 {
            marketplace.siblings.insert(
                format!("S{i}"),
                vec![account("100", vec![sibling(&format!("C{i}"), &format!("S{i}"), 10)])],
            );
        }
        marketplace
            .update_failures
            .lock()
            .unwrap()
            .insert("C1".to_string(), vec![MeliError::permanent("gone")]);
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        let report = h.service.process_message(&message()).await.expect("report");
        let SyncReport::SoftFailed { unsynced, .. } = report else {
            panic!("expected soft failure");
        };
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].listing_id, "C1");
        assert_eq!(h.store.puts.lock().unwrap().len(), 1);
        assert_eq!(h.cache.puts.lock().unwrap().len(), 1);
        assert_eq!(h.queue.acked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sibling_under_unknown_account_counts_as_failed() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "S1", 1)]));
        marketplace
            .siblings
            .insert("S1".to_string(), vec![account("999", vec![sibling("C1", "S1", 10)])]);
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        let err = h
            .service
            .process_message(&message())
            .await
            .expect_err("single item, so one failure breaches the threshold");
        assert_eq!(err.stage(), "sync_quantities");
        assert!(h.marketplace.update_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persist_failure_leaves_message_unacknowledged() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "S1", 1)]));
        marketplace
            .siblings
            .insert("S1".to_string(), vec![account("100", vec![sibling("C1", "S1", 10)])]);
        let h = harness(
            FakeCache::default(),
            FakeStore {
                fail_put: true,
                ..FakeStore::default()
            },
            marketplace,
        );

        let err = h
            .service
            .process_message(&message())
            .await
            .expect_err("should fail");
        assert_eq!(err.stage(), "persist_order");
        assert!(h.cache.puts.lock().unwrap().is_empty());
        assert!(h.queue.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn marker_write_failure_does_not_fail_the_run() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "S1", 1)]));
        marketplace
            .siblings
            .insert("S1".to_string(), vec![account("100", vec![sibling("C1", "S1", 10)])]);
        let h = harness(
            FakeCache {
                fail_put: true,
                ..FakeCache::default()
            },
            FakeStore::default(),
            marketplace,
        );

        let report = h.service.process_message(&message()).await.expect("report");
        assert!(matches!(report, SyncReport::Completed { .. }));
        assert_eq!(h.store.puts.lock().unwrap().len(), 1);
        assert_eq!(h.queue.acked.lock().unwrap().len(), 1);
    }

    // The delta is deliberately not floored at zero; an oversold sibling
    // is pushed negative exactly as the source system does.
    #[tokio::test]
    async fn quantity_delta_is_not_clamped_at_zero() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "S1", 3)]));
        marketplace
            .siblings
            .insert("S1".to_string(), vec![account("100", vec![sibling("C1", "S1", 1)])]);
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        h.service.process_message(&message()).await.expect("report");
        assert_eq!(
            *h.marketplace.update_calls.lock().unwrap(),
            vec![("C1".to_string(), -2)]
        );
    }

    #[tokio::test]
    async fn redelivery_after_persist_writes_exactly_one_record() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "S1", 1)]));
        marketplace
            .siblings
            .insert("S1".to_string(), vec![account("100", vec![sibling("C1", "S1", 10)])]);
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        let first = h.service.process_message(&message()).await.expect("first");
        assert!(matches!(first, SyncReport::Completed { .. }));
        let second = h.service.process_message(&message()).await.expect("second");
        assert!(matches!(second, SyncReport::Skipped { .. }));

        assert_eq!(h.store.puts.lock().unwrap().len(), 1);
        assert_eq!(h.marketplace.update_calls.lock().unwrap().len(), 1);
        assert_eq!(h.queue.acked.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn siblings_across_accounts_all_updated() {
        let mut marketplace = FakeMarketplace::default();
        marketplace.order = Some(order_with(vec![line("L1", "S1", 2)]));
        marketplace.siblings.insert(
            "S1".to_string(),
            vec![
                account("100", vec![sibling("L1", "S1", 10), sibling("C1", "S1", 8)]),
                account("200", vec![sibling("C2", "S1", 5)]),
            ],
        );
        let h = harness(FakeCache::default(), FakeStore::default(), marketplace);

        let report = h.service.process_message(&message()).await.expect("report");
        assert!(matches!(report, SyncReport::Completed { updated: 2, .. }));
        assert_eq!(
            *h.marketplace.update_calls.lock().unwrap(),
            vec![("C1".to_string(), 6), ("C2".to_string(), 3)]
        );
    }
}
