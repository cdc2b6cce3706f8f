use crate::serial::types::PortError;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};

pub const SUPPORTED_BAUD_RATES: [u32; 3] = [9600, 115200, 230400];

/// Open and configure the modem port: raw 8-N-1, no flow control, DTR and RTS
/// asserted. Per-read deadlines are applied by the daemon, not the handle.
pub fn open_port(path: &str, baud_rate: u32) -> Result<SerialStream, PortError> {
    if !SUPPORTED_BAUD_RATES.contains(&baud_rate) {
        return Err(PortError::Open(format!("unsupported baud rate: {baud_rate}")));
    }

    let mut port = tokio_serial::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(|e| PortError::Open(format!("{path}: {e}")))?;

    port.write_data_terminal_ready(true)
        .map_err(|e| PortError::Open(format!("{path}: set DTR: {e}")))?;
    port.write_request_to_send(true)
        .map_err(|e| PortError::Open(format!("{path}: set RTS: {e}")))?;

    Ok(port)
}
