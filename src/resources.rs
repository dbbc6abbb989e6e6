//! Parsing of Kubernetes resource quantities into comparable units.
//!
//! The inventory has to compare a node's allocatable CPU and memory against
//! the injector's requests, and `Quantity` is an opaque string on the wire.
//! Only the forms that show up in node status are handled; anything else is
//! rejected and the caller treats the node as ineligible.
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{Error, Result};

/// Minimum resources a node must have allocatable to host a workload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceRequest {
    /// CPU request in millicores.
    pub cpu_millis: u64,
    /// Memory request in bytes.
    pub memory_bytes: u64,
}

const BINARY_SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: &[(&str, u64)] = &[
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Parses a CPU quantity (`"2"`, `"500m"`, `"0.5"`, `"250u"`, `"1n"`) into
/// millicores, rounding sub-milli values down.
pub fn parse_cpu_millis(quantity: &Quantity) -> Result<u64> {
    let raw = quantity.0.trim();
    let invalid = || Error::InvalidQuantity(raw.to_owned());

    if let Some(number) = raw.strip_suffix('m') {
        return number.parse::<u64>().map_err(|_| invalid());
    }
    if let Some(number) = raw.strip_suffix('u') {
        return number.parse::<u64>().map(|v| v / 1_000).map_err(|_| invalid());
    }
    if let Some(number) = raw.strip_suffix('n') {
        return number
            .parse::<u64>()
            .map(|v| v / 1_000_000)
            .map_err(|_| invalid());
    }

    let cores = raw.parse::<f64>().map_err(|_| invalid())?;
    if cores < 0.0 || !cores.is_finite() {
        return Err(invalid());
    }
    Ok((cores * 1_000.0) as u64)
}

/// Parses a memory quantity (`"64Mi"`, `"1Gi"`, `"128974848"`, `"129e6"`,
/// `"123k"`) into bytes.
pub fn parse_memory_bytes(quantity: &Quantity) -> Result<u64> {
    let raw = quantity.0.trim();
    let invalid = || Error::InvalidQuantity(raw.to_owned());

    for (suffix, multiplier) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES) {
        if let Some(number) = raw.strip_suffix(suffix) {
            let value = number.parse::<f64>().map_err(|_| invalid())?;
            if value < 0.0 || !value.is_finite() {
                return Err(invalid());
            }
            return Ok((value * *multiplier as f64) as u64);
        }
    }

    let value = raw.parse::<f64>().map_err(|_| invalid())?;
    if value < 0.0 || !value.is_finite() {
        return Err(invalid());
    }
    Ok(value as u64)
}
