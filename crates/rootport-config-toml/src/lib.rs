// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use rootport::common::AddressRange;
use rootport::hw::bridge::{atr, PciRange, RangeKind};
use rootport::hw::pci::Bdf;
use rootport::PortResources;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Description of one root port and, for simulation, what sits below it.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub port: Port,

    #[serde(default, rename = "range")]
    pub ranges: Vec<Range>,

    #[serde(default, rename = "device")]
    pub devices: Vec<Device>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Port {
    pub name: String,

    #[serde(default)]
    pub root_bus: u8,

    #[serde(default = "default_atr_slots")]
    pub atr_slots: usize,

    #[serde(default = "default_msi")]
    pub msi: bool,

    pub config_window: Window,
}

fn default_atr_slots() -> usize {
    2
}
fn default_msi() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct Window {
    pub base: u64,
    pub size: u64,
}

/// A host bridge window, as firmware would describe it in `ranges`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Range {
    /// One of `mem`, `prefetch` or `io`
    pub kind: String,
    pub cpu_addr: u64,
    pub pci_addr: u64,
    pub size: u64,
}

impl Range {
    pub fn range_kind(&self) -> Result<RangeKind, ParseError> {
        match self.kind.as_str() {
            "mem" => Ok(RangeKind::Mem),
            "prefetch" => Ok(RangeKind::PrefetchMem),
            "io" => Ok(RangeKind::Io),
            other => Err(ParseError::Invalid(format!(
                "unknown range kind {other:?}"
            ))),
        }
    }
}

/// A simulated endpoint function.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Device {
    pub bdf: String,
    pub vendor_id: u16,
    pub device_id: u16,

    /// Config offset of an MSI capability, if the function has one
    #[serde(default)]
    pub msi_cap: Option<u8>,
}

impl Device {
    pub fn bdf(&self) -> Result<Bdf, ParseError> {
        self.bdf.parse().map_err(|e| {
            ParseError::Invalid(format!("bad bdf {:?}: {e}", self.bdf))
        })
    }
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Resources handed to [`rootport::BridgePort::attach`].
    pub fn port_resources(&self) -> Result<PortResources, ParseError> {
        if self.port.atr_slots == 0 || self.port.atr_slots > atr::MAX_SLOTS {
            return Err(ParseError::Invalid(format!(
                "atr-slots must be between 1 and {}",
                atr::MAX_SLOTS
            )));
        }

        // The root port's own header has to sit inside the window
        let window = self.port.config_window;
        let root_end = (self.port.root_bus as u64 + 1) << 20;
        if root_end > window.size {
            return Err(ParseError::Invalid(format!(
                "root-bus {} lies outside a config-window of {:#x} bytes",
                self.port.root_bus, window.size
            )));
        }

        let ranges = self
            .ranges
            .iter()
            .map(|r| {
                Ok(PciRange {
                    kind: r.range_kind()?,
                    cpu_addr: r.cpu_addr,
                    pci_addr: r.pci_addr,
                    size: r.size,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        Ok(PortResources {
            name: self.port.name.clone(),
            root_bus: self.port.root_bus,
            config_window: AddressRange::new(window.base, window.size),
            ranges,
            atr_slots: self.port.atr_slots,
            msi: self.port.msi,
        })
    }
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod test {
    use super::*;

    const BASIC: &str = r#"
[port]
name = "pcie0"

[port.config-window]
base = 0x3000_0000
size = 0x1000_0000

[[range]]
kind = "mem"
cpu-addr = 0x4000_0000
pci-addr = 0x0
size = 0x0400_0000

[[range]]
kind = "io"
cpu-addr = 0x5000_0000
pci-addr = 0x0
size = 0x1_0000

[[device]]
bdf = "1.0.0"
vendor-id = 0x1af4
device-id = 0x1042
msi-cap = 0x50
"#;

    #[test]
    fn parse_basic_config() {
        let cfg: Config = toml::de::from_str(BASIC).unwrap();

        assert_eq!(cfg.port.name, "pcie0");
        assert_eq!(cfg.port.root_bus, 0);
        assert_eq!(cfg.port.atr_slots, 2);
        assert!(cfg.port.msi);
        assert_eq!(
            cfg.port.config_window,
            Window { base: 0x3000_0000, size: 0x1000_0000 }
        );
        assert_eq!(cfg.ranges.len(), 2);
        assert_eq!(cfg.devices[0].msi_cap, Some(0x50));
        assert_eq!(cfg.devices[0].bdf().unwrap(), Bdf::new(1, 0, 0).unwrap());

        let res = cfg.port_resources().unwrap();
        assert_eq!(
            res.config_window,
            AddressRange::new(0x3000_0000, 0x1000_0000)
        );
        assert_eq!(res.ranges[0].kind, RangeKind::Mem);
        assert_eq!(res.ranges[1].kind, RangeKind::Io);
        assert_eq!(res.ranges[0].cpu_range().size, 0x0400_0000);
    }

    #[test]
    fn config_can_be_serialized_as_toml() {
        let cfg: Config = toml::de::from_str(BASIC).unwrap();
        let serialized = toml::ser::to_string(&cfg).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg: Config = toml::de::from_str(BASIC).unwrap();
        cfg.ranges[0].kind = "cxl".to_string();
        assert!(matches!(cfg.port_resources(), Err(ParseError::Invalid(_))));

        let mut cfg: Config = toml::de::from_str(BASIC).unwrap();
        cfg.port.atr_slots = 0;
        assert!(matches!(cfg.port_resources(), Err(ParseError::Invalid(_))));

        let mut cfg: Config = toml::de::from_str(BASIC).unwrap();
        cfg.devices[0].bdf = "1.40.0".to_string();
        assert!(cfg.devices[0].bdf().is_err());

        let mut cfg: Config = toml::de::from_str(BASIC).unwrap();
        cfg.port.config_window.size = 16 << 20;
        cfg.port.root_bus = 16;
        assert!(matches!(cfg.port_resources(), Err(ParseError::Invalid(_))));
        cfg.port.root_bus = 15;
        assert_eq!(cfg.port_resources().unwrap().root_bus, 15);

        let missing_window = "[port]\nname = \"p\"\n";
        assert!(toml::de::from_str::<Config>(missing_window).is_err());
    }
}
