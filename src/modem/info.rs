use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

pub const QUERY_SERVING_CELL: &str = "AT+QENG=\"servingcell\"";

/// Typed result of one info provider. The parsing stage never hands out
/// erased values; every provider commits to one of these shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    Text(String),
    Int(i64),
    Bool(bool),
}
impl Display for InfoValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InfoValue::Text(text) => write!(f, "{text}"),
            InfoValue::Int(value) => write!(f, "{value}"),
            InfoValue::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// A named query: the AT commands it issues and the pure parse function
/// mapping the raw response text to a typed value.
pub struct InfoProvider {
    pub key: &'static str,
    pub commands: &'static [&'static str],
    pub parse: fn(&str) -> Result<InfoValue>,
}

pub struct InfoRegistry {
    providers: HashMap<&'static str, InfoProvider>,
}
impl InfoRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry preloaded with every built-in provider.
    pub fn with_default_providers() -> Self {
        let mut registry = Self::new();
        for provider in default_providers() {
            registry.register(provider);
        }
        registry
    }

    pub fn register(&mut self, provider: InfoProvider) {
        self.providers.insert(provider.key, provider);
    }

    pub fn get(&self, key: &str) -> Option<&InfoProvider> {
        self.providers.get(key)
    }

    pub fn all_keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<&'static str> = self.providers.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}
impl Default for InfoRegistry {
    fn default() -> Self {
        Self::with_default_providers()
    }
}

/// Partial results of a composite query. Failed keys land in `errors` without
/// short-circuiting the rest.
#[derive(Debug, Default)]
pub struct InfoReport {
    pub values: HashMap<&'static str, InfoValue>,
    pub errors: Vec<String>,
}
impl InfoReport {
    pub fn aggregate_error(&self) -> Option<anyhow::Error> {
        if self.errors.is_empty() {
            None
        } else {
            Some(anyhow!(
                "encountered {} errors: {}",
                self.errors.len(),
                self.errors.join("; ")
            ))
        }
    }
}

fn default_providers() -> Vec<InfoProvider> {
    vec![
        InfoProvider {
            key: "ModuleName",
            commands: &["ATI"],
            parse: parse_module_name,
        },
        InfoProvider {
            key: "ModuleCPUTemp",
            commands: &["AT+QTEMP"],
            parse: parse_cpu_temp,
        },
        InfoProvider {
            key: "SimStatus",
            commands: &["AT+QSIMSTAT?"],
            parse: parse_sim_status,
        },
        InfoProvider {
            key: "SimActive",
            commands: &["AT+QUIMSLOT?"],
            parse: parse_sim_active,
        },
        InfoProvider {
            key: "APN",
            commands: &["AT+CGCONTRDP"],
            parse: parse_apn,
        },
        InfoProvider {
            key: "IPV4",
            commands: &["AT+QMAP=\"WWAN\""],
            parse: parse_ipv4,
        },
        InfoProvider {
            key: "IPV6",
            commands: &["AT+QMAP=\"WWAN\""],
            parse: parse_ipv6,
        },
        InfoProvider {
            key: "MCCMNC",
            commands: &["AT+QSPN"],
            parse: parse_mccmnc,
        },
        InfoProvider {
            key: "NetworkMode",
            commands: &[QUERY_SERVING_CELL],
            parse: parse_network_mode,
        },
        InfoProvider {
            key: "DuplexMode",
            commands: &[QUERY_SERVING_CELL],
            parse: parse_duplex_mode,
        },
        InfoProvider {
            key: "CellID",
            commands: &[QUERY_SERVING_CELL],
            parse: parse_cell_id,
        },
        InfoProvider {
            key: "DownloadSize",
            commands: &["AT+QGDCNT?", "AT+QGDNRCNT?"],
            parse: parse_download_size,
        },
        InfoProvider {
            key: "UploadSize",
            commands: &["AT+QGDCNT?", "AT+QGDNRCNT?"],
            parse: parse_upload_size,
        },
        InfoProvider {
            key: "LTE_RSRP",
            commands: &[QUERY_SERVING_CELL],
            parse: parse_lte_rsrp,
        },
        InfoProvider {
            key: "LTE_RSRQ",
            commands: &[QUERY_SERVING_CELL],
            parse: parse_lte_rsrq,
        },
        InfoProvider {
            key: "LTE_SINR",
            commands: &[QUERY_SERVING_CELL],
            parse: parse_lte_sinr,
        },
        InfoProvider {
            key: "NR_RSRP",
            commands: &[QUERY_SERVING_CELL],
            parse: parse_nr_rsrp,
        },
        InfoProvider {
            key: "NR_RSRQ",
            commands: &[QUERY_SERVING_CELL],
            parse: parse_nr_rsrq,
        },
        InfoProvider {
            key: "NR_SINR",
            commands: &[QUERY_SERVING_CELL],
            parse: parse_nr_sinr,
        },
    ]
}

fn unquote(field: &str) -> String {
    field.replace('"', "")
}

fn find_line<'a>(response: &'a str, needle: &str) -> Option<&'a str> {
    response.split("\r\n").find(|line| line.contains(needle))
}

fn parse_module_name(response: &str) -> Result<InfoValue> {
    let lines: Vec<&str> = response.split("\r\n").collect();
    if lines.len() > 2 {
        Ok(InfoValue::Text(format!("{}{}", lines[1], lines[2])))
    } else {
        bail!("module name response too short")
    }
}

fn parse_cpu_temp(response: &str) -> Result<InfoValue> {
    let line = find_line(response, "cpu0").ok_or_else(|| anyhow!("CPU temp not found"))?;
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() == 2 {
        let temp: i64 = unquote(parts[1])
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid CPU temp value"))?;
        Ok(InfoValue::Int(temp))
    } else {
        bail!("CPU temp not found")
    }
}

fn parse_sim_status(response: &str) -> Result<InfoValue> {
    let line = find_line(response, "+QSIMSTAT").ok_or_else(|| anyhow!("SIM status not found"))?;
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() == 2 {
        Ok(InfoValue::Bool(parts[1].trim() == "1"))
    } else {
        bail!("SIM status not found")
    }
}

fn parse_sim_active(response: &str) -> Result<InfoValue> {
    let line =
        find_line(response, "+QUIMSLOT:").ok_or_else(|| anyhow!("SIM active slot not found"))?;
    let slot = line
        .trim_end()
        .chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .ok_or_else(|| anyhow!("invalid SIM slot digit"))?;
    Ok(InfoValue::Int(slot as i64))
}

fn parse_apn(response: &str) -> Result<InfoValue> {
    let line = find_line(response, "+CGCONTRDP: 1").ok_or_else(|| anyhow!("APN not found"))?;
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() >= 3 {
        Ok(InfoValue::Text(unquote(parts[2])))
    } else {
        bail!("APN not found")
    }
}

fn parse_wwan_address(response: &str, family: &str) -> Result<InfoValue> {
    let line =
        find_line(response, family).ok_or_else(|| anyhow!("{family} address not found"))?;
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() >= 5 {
        Ok(InfoValue::Text(unquote(parts[4])))
    } else {
        bail!("{family} address not found")
    }
}

fn parse_ipv4(response: &str) -> Result<InfoValue> {
    parse_wwan_address(response, "IPV4")
}

fn parse_ipv6(response: &str) -> Result<InfoValue> {
    parse_wwan_address(response, "IPV6")
}

fn parse_mccmnc(response: &str) -> Result<InfoValue> {
    let line = find_line(response, "+QSPN").ok_or_else(|| anyhow!("MCCMNC not found"))?;
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() >= 5 {
        let mccmnc: i64 = unquote(parts[4])
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid MCCMNC value"))?;
        Ok(InfoValue::Int(mccmnc))
    } else {
        bail!("MCCMNC not found")
    }
}

fn serving_cell_field(response: &str, index: usize, label: &str) -> Result<String> {
    let line =
        find_line(response, "servingcell").ok_or_else(|| anyhow!("{label} not found"))?;
    let parts: Vec<&str> = line.split(',').collect();
    parts
        .get(index)
        .map(|field| unquote(field))
        .ok_or_else(|| anyhow!("{label} not found"))
}

fn parse_network_mode(response: &str) -> Result<InfoValue> {
    serving_cell_field(response, 2, "network mode").map(InfoValue::Text)
}

fn parse_duplex_mode(response: &str) -> Result<InfoValue> {
    serving_cell_field(response, 3, "duplex mode").map(InfoValue::Text)
}

fn parse_cell_id(response: &str) -> Result<InfoValue> {
    serving_cell_field(response, 6, "cell ID").map(InfoValue::Text)
}

/// Sum one counter field across the QGDCNT and QGDNRCNT responses. The two
/// counters track LTE and NR traffic independently and must be added.
fn sum_traffic_counters(response: &str, field: usize) -> i64 {
    let mut total = 0i64;
    for line in response.split("\r\n") {
        let Some(values) = line
            .trim()
            .strip_prefix("+QGDCNT: ")
            .or_else(|| line.trim().strip_prefix("+QGDNRCNT: "))
        else {
            continue;
        };
        let parts: Vec<&str> = values.split(',').collect();
        if let Some(value) = parts.get(field).and_then(|p| p.trim().parse::<i64>().ok()) {
            total += value;
        }
    }
    total
}

fn parse_download_size(response: &str) -> Result<InfoValue> {
    Ok(InfoValue::Text(bytes_to_size(
        sum_traffic_counters(response, 0) as f64,
    )))
}

fn parse_upload_size(response: &str) -> Result<InfoValue> {
    Ok(InfoValue::Text(bytes_to_size(
        sum_traffic_counters(response, 1) as f64,
    )))
}

/// Signal metrics live on the same `servingcell` line as the network mode, so
/// the mode gate never needs a second query.
fn parse_serving_signal(
    response: &str,
    mode_needle: &str,
    index: usize,
    label: &str,
) -> Result<InfoValue> {
    let line =
        find_line(response, "servingcell").ok_or_else(|| anyhow!("{label} not found"))?;
    let parts: Vec<&str> = line.split(',').collect();

    let mode = parts
        .get(2)
        .map(|field| unquote(field))
        .ok_or_else(|| anyhow!("{label} not found"))?;
    if !mode.contains(mode_needle) {
        bail!("not in {mode_needle} mode");
    }

    if parts.len() >= 15 {
        let value: i64 = unquote(parts[index])
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid {label} value"))?;
        Ok(InfoValue::Int(value))
    } else {
        bail!("{label} not found")
    }
}

fn parse_lte_rsrp(response: &str) -> Result<InfoValue> {
    parse_serving_signal(response, "LTE", 12, "LTE RSRP")
}

fn parse_lte_rsrq(response: &str) -> Result<InfoValue> {
    parse_serving_signal(response, "LTE", 13, "LTE RSRQ")
}

fn parse_lte_sinr(response: &str) -> Result<InfoValue> {
    parse_serving_signal(response, "LTE", 14, "LTE SINR")
}

fn parse_nr_rsrp(response: &str) -> Result<InfoValue> {
    parse_serving_signal(response, "5G", 12, "NR RSRP")
}

fn parse_nr_rsrq(response: &str) -> Result<InfoValue> {
    parse_serving_signal(response, "5G", 13, "NR RSRQ")
}

fn parse_nr_sinr(response: &str) -> Result<InfoValue> {
    parse_serving_signal(response, "5G", 14, "NR SINR")
}

/// Human-readable byte count: largest unit keeping the value at or above one,
/// rounded, four decimal places.
pub fn bytes_to_size(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KiB", "MiB", "GiB", "TiB"];

    if bytes == 0.0 {
        return "0 Byte".to_string();
    }
    let exponent = ((bytes.ln() / 1024f64.ln()).floor() as usize).min(UNITS.len() - 1);
    let value = (bytes / 1024f64.powi(exponent as i32)).round();

    format!("{value:.4}{}", UNITS[exponent])
}
