//! Port discovery: enumerate serial ports and pick the most likely sensor board.

use super::{PortInfo, Result, SerialBackend, SerialError};

/// Manufacturer substrings of common microcontroller boards and USB-UART bridges.
pub const KNOWN_MANUFACTURERS: [&str; 6] = [
    "arduino",
    "esp32",
    "silicon labs",
    "ch340",
    "ftdi",
    "prolific",
];

/// Arduino, Silicon Labs (CP210x), QinHeng (CH340), FTDI.
pub const KNOWN_VENDOR_IDS: [u16; 4] = [0x2341, 0x10C4, 0x1A86, 0x0403];

const VID_SCORE: u8 = 2;
const MANUFACTURER_SCORE: u8 = 1;

/// Enumerate serial ports in the order the OS reports them
pub fn list_candidate_ports(backend: &dyn SerialBackend) -> Result<Vec<PortInfo>> {
    let ports = backend.list_ports()?;
    log::debug!("Enumerated {} serial port(s)", ports.len());
    Ok(ports)
}

/// Vendor signature score of a port; 0 means no known signature.
pub fn score_port(port: &PortInfo) -> u8 {
    let mut score = 0;
    if port.vid.is_some_and(|vid| KNOWN_VENDOR_IDS.contains(&vid)) {
        score += VID_SCORE;
    }
    if let Some(manufacturer) = &port.manufacturer {
        let manufacturer = manufacturer.to_lowercase();
        if KNOWN_MANUFACTURERS.iter().any(|m| manufacturer.contains(m)) {
            score += MANUFACTURER_SCORE;
        }
    }
    score
}

/// Pick the highest scoring port. Ties keep enumeration order and a list
/// with no known signature falls back to its first port.
pub fn select_best_port(ports: &[PortInfo]) -> Result<PortInfo> {
    let first = ports.first().ok_or(SerialError::NoPortsAvailable)?;

    let mut best = first;
    let mut best_score = score_port(first);
    for port in &ports[1..] {
        let score = score_port(port);
        if score > best_score {
            best = port;
            best_score = score;
        }
    }

    if best_score == 0 {
        log::warn!(
            "No known sensor board among {} port(s), falling back to {}",
            ports.len(),
            best.port_name
        );
    } else {
        log::info!("Selected {} (score {})", best.port_name, best_score);
    }
    Ok(best.clone())
}
