use crate::modem::sms::SmsRecord;
use std::sync::{Arc, Mutex};
use tracing::log::debug;

/// Capability handed to anything that wants to hear about newly persisted
/// messages.
pub trait SmsObserver: Send + Sync {
    fn on_new_sms(&self, sms: SmsRecord);
}

/// Fan-out point for new-message events. Each delivery runs on a detached
/// task, so one slow observer cannot stall the reconciliation loop.
#[derive(Default)]
pub struct ObserverBus {
    observers: Mutex<Vec<Arc<dyn SmsObserver>>>,
}
impl ObserverBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn SmsObserver>) {
        self.observers
            .lock()
            .expect("observer list poisoned")
            .push(observer);
    }

    pub fn notify_new_sms(&self, sms: &SmsRecord) {
        let observers = self
            .observers
            .lock()
            .expect("observer list poisoned")
            .clone();
        debug!(
            "notifying {} observers of new sms from {}",
            observers.len(),
            sms.sender
        );

        for observer in observers {
            let sms = sms.clone();
            tokio::spawn(async move {
                observer.on_new_sms(sms);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tokio::sync::mpsc;

    struct ChannelObserver {
        tx: mpsc::UnboundedSender<SmsRecord>,
    }
    impl SmsObserver for ChannelObserver {
        fn on_new_sms(&self, sms: SmsRecord) {
            let _ = self.tx.send(sms);
        }
    }

    fn sample_record() -> SmsRecord {
        SmsRecord {
            sender: "+8613912345678".to_string(),
            content: "ping".to_string(),
            status: "REC UNREAD".to_string(),
            received_at: NaiveDate::from_ymd_opt(2025, 7, 30)
                .unwrap()
                .and_hms_opt(10, 21, 33)
                .unwrap(),
            modem_index: 3,
        }
    }

    #[tokio::test]
    async fn test_every_registered_observer_is_notified() {
        let bus = ObserverBus::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        bus.register(Arc::new(ChannelObserver { tx: tx_a }));
        bus.register(Arc::new(ChannelObserver { tx: tx_b }));

        let record = sample_record();
        bus.notify_new_sms(&record);

        assert_eq!(rx_a.recv().await.unwrap(), record);
        assert_eq!(rx_b.recv().await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_notify_without_observers_is_a_no_op() {
        let bus = ObserverBus::new();
        bus.notify_new_sms(&sample_record());
    }
}
