use crate::modem::{codec, ModemInterface};
use crate::serial::types::PortError;
use anyhow::{bail, Result};
use chrono::NaiveDateTime;
use std::time::Duration;
use thiserror::Error;
use tracing::log::{debug, info, warn};

/// Composite inbox fetch: configure text mode, UCS-2 charset, modem-memory
/// storage, then list everything. One round trip keeps the modem state and
/// the listing consistent.
pub const INBOX_FETCH_COMMAND: &str = "AT+CSMS=1;+CSDH=0;+CNMI=2,1,0,0,0;+CMGF=1;+CSCA?;+CSMP=17,167,0,8;+CPMS=\"ME\",\"ME\",\"ME\";+CSCS=\"UCS2\";+CMGL=\"ALL\"";

const INBOX_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const DELETE_TIMEOUT: Duration = Duration::from_secs(1);
const BODY_COMMIT_TIMEOUT: Duration = Duration::from_secs(3);
const RESYNC_TIMEOUT: Duration = Duration::from_secs(1);

/// Modem timestamps look like `25/07/30,10:21:33` once the zone suffix is
/// trimmed.
const SMS_TIMESTAMP_FORMAT: &str = "%y/%m/%d,%H:%M:%S";
const TIMESTAMP_ZONE_SUFFIX_LEN: usize = 3;

/// At most this many indices per AT+CMGD command.
pub const DELETE_BATCH_SIZE: usize = 10;

/// One message as listed by the modem inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SmsRecord {
    pub sender: String,
    pub content: String,
    pub status: String,
    pub received_at: NaiveDateTime,
    pub modem_index: i32,
}

#[derive(Debug, Error)]
pub enum SmsSendError {
    #[error("modem never presented the send prompt")]
    NoPrompt,

    #[error("modem rejected the message: {0}")]
    Rejected(String),

    #[error(transparent)]
    Transport(#[from] PortError),
}

impl ModemInterface {
    /// Fetch every message currently in the modem inbox. Malformed entries
    /// are skipped with a warning; a response without OK fails the fetch.
    pub async fn fetch_inbox(&self) -> Result<Vec<SmsRecord>> {
        let raw = self
            .fetch_raw(INBOX_FETCH_COMMAND, INBOX_FETCH_TIMEOUT)
            .await?;
        if !raw.contains("OK") {
            bail!("inbox fetch failed: {:?}", raw.trim());
        }
        Ok(parse_inbox(&raw))
    }

    /// Delete inbox entries modem-side, batched onto semicolon-joined
    /// commands.
    pub async fn delete_messages(&self, indices: &[i32]) -> Result<()> {
        for batch in indices.chunks(DELETE_BATCH_SIZE) {
            let command = build_delete_command(batch);
            let raw = self.fetch_raw(&command, DELETE_TIMEOUT).await?;
            if !raw.contains("OK") {
                bail!("delete sms {batch:?} failed: {:?}", raw.trim());
            }
            info!("deleted sms {batch:?} from modem inbox");
        }
        Ok(())
    }

    /// Two-phase interactive send: the CMGS header must be answered with a
    /// `>` prompt before the UCS-2 body is committed with Ctrl-Z.
    pub async fn send_text(&self, phone: &str, text: &str) -> Result<(), SmsSendError> {
        let reference: u8 = rand::random();
        let header = format!(
            "AT+CMGF=1;+CSCS=\"UCS2\";+CMGS=\"{}\",{},1,1\r\n",
            codec::ucs2_hex(phone),
            reference
        );
        debug!("sending sms to {phone} with reference {reference}");

        let prompt_response = match self
            .fetch_raw_uncached(header.into_bytes(), self.send_timeout())
            .await
        {
            Ok(raw) => raw,
            Err(PortError::Timeout | PortError::Unresponsive(_)) => {
                self.resync().await;
                return Err(SmsSendError::NoPrompt);
            }
            Err(e) => return Err(SmsSendError::Transport(e)),
        };
        if !prompt_response.contains('>') {
            warn!("send prompt never arrived: {:?}", prompt_response.trim());
            self.resync().await;
            return Err(SmsSendError::NoPrompt);
        }

        let mut body = codec::ucs2_hex(text).into_bytes();
        body.push(0x1A);
        let commit_response = self.fetch_raw_uncached(body, BODY_COMMIT_TIMEOUT).await?;

        if commit_response.contains("OK") {
            info!("sms to {phone} accepted with reference {reference}");
            Ok(())
        } else {
            Err(SmsSendError::Rejected(commit_response.trim().to_string()))
        }
    }

    /// Push a bare AT through to shake the modem out of prompt mode after a
    /// failed handshake.
    async fn resync(&self) {
        if let Err(e) = self
            .fetch_raw_uncached(b"\r\nAT\r\n".to_vec(), RESYNC_TIMEOUT)
            .await
        {
            warn!("post-prompt resync failed: {e}");
        }
    }
}

fn parse_inbox(raw: &str) -> Vec<SmsRecord> {
    let lines: Vec<&str> = raw.split("\r\n").collect();
    let mut records = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        if !line.contains("+CMGL:") {
            continue;
        }
        match parse_inbox_entry(line, lines.get(index + 1).copied()) {
            Ok(record) => {
                debug!(
                    "inbox entry {} from {} at {}",
                    record.modem_index, record.sender, record.received_at
                );
                records.push(record);
            }
            Err(e) => warn!("skipping malformed inbox entry {line:?}: {e}"),
        }
    }
    records
}

fn parse_inbox_entry(header: &str, body: Option<&str>) -> Result<SmsRecord> {
    let fields: Vec<&str> = header.split(',').collect();
    if fields.len() < 6 {
        bail!("header has only {} fields", fields.len());
    }

    let modem_index: i32 = fields[0]
        .replace("+CMGL: ", "")
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid inbox index {:?}", fields[0]))?;
    let status = fields[1].replace('"', "");
    let sender = codec::decode_ucs2_hex(&fields[2].replace('"', ""))?;

    // The timestamp itself contains a comma, so it spans two fields. The
    // trailing `+zz` zone suffix is dropped before parsing.
    let date_text = format!("{},{}", fields[4].replace('"', ""), fields[5].replace('"', ""));
    if date_text.len() <= TIMESTAMP_ZONE_SUFFIX_LEN {
        bail!("timestamp too short: {date_text:?}");
    }
    let received_at = NaiveDateTime::parse_from_str(
        &date_text[..date_text.len() - TIMESTAMP_ZONE_SUFFIX_LEN],
        SMS_TIMESTAMP_FORMAT,
    )?;

    // A missing or undecodable body keeps the entry; the envelope is still
    // worth persisting and deleting.
    let content = body
        .map(|line| codec::decode_ucs2_hex(line).unwrap_or_default())
        .unwrap_or_default();

    Ok(SmsRecord {
        sender,
        content,
        status,
        received_at,
        modem_index,
    })
}

fn build_delete_command(indices: &[i32]) -> String {
    indices
        .iter()
        .enumerate()
        .map(|(position, index)| {
            if position == 0 {
                format!("AT+CMGD={index}")
            } else {
                format!("+CMGD={index}")
            }
        })
        .collect::<Vec<String>>()
        .join(";")
}
