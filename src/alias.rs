//! Human-readable names for meters.
//!
//! An alias replaces the generated entity name in the Home Assistant
//! discovery message, e.g. `Kitchen` instead of `C7EBE0FC8708 Temperature`.

use crate::mac_address::MacAddress;
use std::collections::BTreeMap;

/// Address-to-name mappings.
pub type AliasMap = BTreeMap<MacAddress, String>;

/// A parsed alias mapping a MAC address to a human-readable name.
#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub address: MacAddress,
    pub name: String,
}

/// Parse an alias from a string in the format "MAC=NAME".
///
/// # Example
/// ```
/// use switchbot_meter_bridge::alias::parse_alias;
///
/// let alias = parse_alias("C7:EB:E0:FC:87:08=Kitchen").unwrap();
/// assert_eq!(alias.address.to_string(), "C7:EB:E0:FC:87:08");
/// assert_eq!(alias.name, "Kitchen");
/// ```
pub fn parse_alias(src: &str) -> Result<Alias, String> {
    let (address, name) = src
        .split_once('=')
        .ok_or_else(|| "invalid alias: expected format MAC=NAME".to_string())?;

    let name = name.trim();
    if name.is_empty() {
        return Err("invalid alias: name is empty".to_string());
    }

    Ok(Alias {
        address: address.parse().map_err(|e| format!("invalid alias: {e}"))?,
        name: name.to_string(),
    })
}

/// Collect aliases into a lookup map; later entries win.
pub fn to_map(aliases: &[Alias]) -> AliasMap {
    aliases
        .iter()
        .map(|a| (a.address, a.name.clone()))
        .collect()
}
