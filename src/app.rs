use crate::config::AppConfig;
use crate::modem::sms::SmsRecord;
use crate::modem::ModemInterface;
use crate::serial::SerialSupervisor;
use crate::sms::observer::SmsObserver;
use crate::sms::SmsManager;
use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::log::{error, info};

/// Default observer: surface every new message in the logs.
struct LogNewSms;
impl SmsObserver for LogNewSms {
    fn on_new_sms(&self, sms: SmsRecord) {
        info!(
            "incoming sms from {} at {}: {:?}",
            sms.sender, sms.received_at, sms.content
        );
    }
}

pub struct AppHandles {
    modem: Arc<ModemInterface>,
    manager: SmsManager,
}
impl AppHandles {
    pub async fn new(config: AppConfig) -> Result<AppHandles> {
        if !config.serial.is_local {
            bail!("remote serial transport is not supported");
        }

        info!(
            "supervising serial port {} at {} baud",
            config.serial.port, config.serial.baud_rate
        );
        let supervisor = Arc::new(SerialSupervisor::start(config.serial.clone()));
        let modem = Arc::new(ModemInterface::new(
            supervisor,
            config.sms.send_timeout(),
        ));

        let mut manager = SmsManager::connect(Arc::clone(&modem), config.sms).await?;
        manager.register_observer(Arc::new(LogNewSms));
        manager.start()?;

        Ok(AppHandles { modem, manager })
    }

    /// Block until shutdown is requested, then stop the loops cleanly.
    pub async fn run(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {e}");
        }
        info!("shutting down");

        self.manager.stop();
        self.modem.stop();
    }
}
