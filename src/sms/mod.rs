use crate::config::SmsConfig;
use crate::modem::sms::SmsRecord;
use crate::modem::ModemInterface;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::log::{debug, error, info, warn};

pub mod database;
pub mod observer;

use database::{SmsDatabase, StoredSms};
use observer::{ObserverBus, SmsObserver};

/// Periodically reconciles the modem inbox into the record store: fetch,
/// persist idempotently, delete modem-side, notify observers of anything new.
pub struct SmsManager {
    modem: Arc<ModemInterface>,
    database: Arc<SmsDatabase>,
    observers: Arc<ObserverBus>,
    config: SmsConfig,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Option<mpsc::Receiver<()>>,
    quit_tx: watch::Sender<bool>,
}
impl SmsManager {
    pub async fn connect(modem: Arc<ModemInterface>, config: SmsConfig) -> Result<Self> {
        let database = Arc::new(SmsDatabase::connect(&config.db_path).await?);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (quit_tx, _) = watch::channel(false);

        Ok(Self {
            modem,
            database,
            observers: Arc::new(ObserverBus::new()),
            config,
            trigger_tx,
            trigger_rx: Some(trigger_rx),
            quit_tx,
        })
    }

    pub fn register_observer(&self, observer: Arc<dyn SmsObserver>) {
        self.observers.register(observer);
    }

    /// Ask the loop for an immediate check, on top of the schedule. Dropped
    /// silently if a check is already queued.
    pub fn trigger_check(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Spawn the reconciliation loop. The first check runs immediately.
    pub fn start(&mut self) -> Result<()> {
        let Some(mut trigger_rx) = self.trigger_rx.take() else {
            // Already started once.
            return Ok(());
        };

        let modem = Arc::clone(&self.modem);
        let database = Arc::clone(&self.database);
        let observers = Arc::clone(&self.observers);
        let check_interval = self.config.check_interval();
        let mut quit_rx = self.quit_tx.subscribe();

        info!("sms reconciliation started, checking every {check_interval:?}");
        tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        check_and_process(&modem, &database, &observers).await;
                    }
                    Some(_) = trigger_rx.recv() => {
                        debug!("manual sms check triggered");
                        check_and_process(&modem, &database, &observers).await;
                    }
                    _ = quit_rx.changed() => {
                        info!("sms reconciliation loop exiting");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.quit_tx.send(true);
    }

    pub async fn sms_count(&self) -> Result<i64> {
        self.database.count().await
    }

    pub async fn get_sms(&self, id: i64) -> Result<Option<StoredSms>> {
        self.database.get_sms(id).await
    }

    pub async fn get_sms_range(&self, start_id: i64, end_id: i64) -> Result<Vec<StoredSms>> {
        self.database.get_sms_range(start_id, end_id).await
    }
}

async fn check_and_process(
    modem: &ModemInterface,
    database: &SmsDatabase,
    observers: &ObserverBus,
) {
    debug!("checking modem inbox");

    let records = match modem.fetch_inbox().await {
        Ok(records) => records,
        Err(e) => {
            // Leave the inbox alone; the next tick retries.
            warn!("inbox fetch failed: {e}");
            return;
        }
    };
    if records.is_empty() {
        debug!("no incoming sms");
        return;
    }

    let total = records.len();
    let (to_delete, new_count) = reconcile(records, database, observers).await;

    if !to_delete.is_empty() {
        if let Err(e) = modem.delete_messages(&to_delete).await {
            // The uniqueness key absorbs the duplicates next tick.
            error!("failed to delete reconciled sms from modem: {e}");
        }
    }

    info!("reconciliation complete, {total} listed, {new_count} new");
}

/// Persist each record, notifying observers for first-time inserts only.
/// Returns the modem indices safe to delete and the new-message count; a
/// record that failed to persist stays in the modem inbox for the next tick.
async fn reconcile(
    records: Vec<SmsRecord>,
    database: &SmsDatabase,
    observers: &ObserverBus,
) -> (Vec<i32>, usize) {
    let mut to_delete = Vec::with_capacity(records.len());
    let mut new_count = 0;

    for sms in records {
        match database.insert_sms(&sms).await {
            Ok((id, true)) => {
                info!("new sms #{id} from {}", sms.sender);
                observers.notify_new_sms(&sms);
                new_count += 1;
            }
            Ok((id, false)) => debug!("sms #{id} from {} already stored", sms.sender),
            Err(e) => {
                error!("failed to store sms from {}: {e}", sms.sender);
                continue;
            }
        }
        to_delete.push(sms.modem_index);
    }

    (to_delete, new_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingObserver {
        notified: Arc<AtomicUsize>,
    }
    impl SmsObserver for CountingObserver {
        fn on_new_sms(&self, _sms: SmsRecord) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(sender: &str, content: &str, index: i32) -> SmsRecord {
        SmsRecord {
            sender: sender.to_string(),
            content: content.to_string(),
            status: "REC UNREAD".to_string(),
            received_at: NaiveDate::from_ymd_opt(2025, 7, 30)
                .unwrap()
                .and_hms_opt(10, 21, 33)
                .unwrap(),
            modem_index: index,
        }
    }

    async fn test_setup() -> (TempDir, SmsDatabase, Arc<ObserverBus>, Arc<AtomicUsize>) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sms.db");
        let db = SmsDatabase::connect(path.to_str().unwrap()).await.unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let bus = Arc::new(ObserverBus::new());
        bus.register(Arc::new(CountingObserver {
            notified: Arc::clone(&notified),
        }));

        (dir, db, bus, notified)
    }

    async fn settle() {
        // Observer dispatch runs on detached tasks.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_duplicate_inbox_entries_notify_once_but_delete_twice() {
        let (_dir, db, bus, notified) = test_setup().await;

        // Two modem slots holding the same message on the uniqueness key.
        let records = vec![record("你好", "ping", 3), record("你好", "ping", 4)];
        let (to_delete, new_count) = reconcile(records, &db, &bus).await;
        settle().await;

        assert_eq!(to_delete, vec![3, 4]);
        assert_eq!(new_count, 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(db.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let (_dir, db, bus, notified) = test_setup().await;

        let records = vec![record("a", "one", 1), record("b", "two", 2)];
        let (to_delete, new_count) = reconcile(records.clone(), &db, &bus).await;
        settle().await;
        assert_eq!(to_delete, vec![1, 2]);
        assert_eq!(new_count, 2);
        assert_eq!(notified.load(Ordering::SeqCst), 2);

        // Same inbox again, as after a failed modem-side delete: rows and
        // notifications stay put, deletion is re-attempted.
        let (to_delete, new_count) = reconcile(records, &db, &bus).await;
        settle().await;
        assert_eq!(to_delete, vec![1, 2]);
        assert_eq!(new_count, 0);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
        assert_eq!(db.count().await.unwrap(), 2);
    }
}
