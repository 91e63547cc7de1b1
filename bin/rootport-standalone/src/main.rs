// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use clap::Parser;
use slog::{o, Drain};

use rootport::common::Width;
use rootport::hw::pci::{bits as pci_bits, DevFn, INTxPinID};
use rootport::hw::sim::{RecordingSink, SimBridge};
use rootport::intr_pins::LogicalInterrupt;
use rootport::BridgePort;

#[derive(clap::Parser)]
/// Attach a root port to simulated bridge hardware, enumerate what sits
/// behind it and exercise its interrupt path.
struct Args {
    /// Port configuration (TOML)
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// Leave the link in training: only the root port is reachable.
    #[clap(long, action)]
    link_down: bool,

    /// Assert a legacy INTx line (0-3) before dispatching. May be repeated.
    #[clap(long = "intx", value_name = "LINE",
        value_parser = clap::value_parser!(u32).range(0..4))]
    intx: Vec<u32>,

    /// Assert every MSI vector handed out during enumeration.
    #[clap(long, action)]
    fire_msi: bool,
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

/// Walk the root bus and the bus directly behind it the way a generic
/// enumerator would, returning every function that answered.
fn enumerate(port: &BridgePort, log: &slog::Logger) -> Vec<(u8, DevFn)> {
    let root = port.root_bus();
    let mut found = Vec::new();
    for bus in root..=root.saturating_add(1) {
        for raw in 0..=u8::MAX {
            let devfn = DevFn::from_raw(raw);
            let ids = port.config_read(
                bus,
                devfn,
                pci_bits::OFFSET_VENDOR_ID as u16,
                Width::Dword,
            );
            if ids as u16 == pci_bits::VENDOR_ID_NONE {
                continue;
            }
            slog::info!(log, "found function";
                "bus" => bus,
                "devfn" => %devfn,
                "vendor" => format!("{:#06x}", ids & 0xffff),
                "device" => format!("{:#06x}", ids >> 16));
            found.push((bus, devfn));
        }
    }
    found
}

fn main() -> anyhow::Result<()> {
    let Args { config, link_down, intx, fire_msi } = Args::parse();

    let (log, _log_async_guard) = build_log();
    slog::info!(log, "rootport-standalone"; "version" => rootport::version());

    let config = rootport_config_toml::parse(&config)
        .with_context(|| format!("failed to parse {config}"))?;
    let res = config.port_resources()?;

    let ecam_len = usize::try_from(res.config_window.size)
        .context("config window does not fit the address space")?;
    let sim = SimBridge::new(res.root_bus, ecam_len);
    sim.set_link_up(!link_down);

    let mut msi_capable = BTreeMap::new();
    for dev in &config.devices {
        let bdf = dev.bdf()?;
        if bdf.bus.get() == res.root_bus {
            bail!("{bdf} collides with the root port's own bus");
        }
        if (bdf.bus.get() as usize + 1) << 20 > ecam_len {
            bail!("{bdf} lies outside the config window");
        }
        sim.add_endpoint(bdf, dev.vendor_id, dev.device_id, dev.msi_cap);
        if dev.msi_cap.is_some() {
            msi_capable.insert((bdf.bus.get(), bdf.devfn().raw()), bdf);
        }
    }

    let sink = RecordingSink::new();
    let port = BridgePort::attach(res, sim.regs(), sink.clone(), &log)
        .context("root port attach failed")?;

    for region in port.atr().enabled_regions() {
        let param = port.atr().hw_param(region.slot_index)?;
        slog::info!(log, "translation slot";
            "region" => %region, "param" => format!("{param:#010x}"));
    }

    let mut vectors: Vec<LogicalInterrupt> = Vec::new();
    for (bus, devfn) in enumerate(&port, &log) {
        let Some(bdf) = msi_capable.get(&(bus, devfn.raw())) else {
            continue;
        };
        match port.setup_msi(*bdf) {
            Ok(irq) => {
                slog::info!(log, "msi assigned"; "bdf" => %bdf, "irq" => %irq);
                vectors.push(irq);
            }
            Err(e) => slog::warn!(log, "msi setup failed";
                "bdf" => %bdf, "error" => %e),
        }
    }

    let router = port.router();
    for line in intx {
        let Some(pin) = INTxPinID::from_line(line) else {
            continue;
        };
        let irq = router.map_legacy(pin);
        slog::info!(log, "raising intx"; "pin" => ?pin, "irq" => %irq);
        sim.raise_intx(pin);
    }
    if fire_msi {
        for irq in &vectors {
            sim.raise_msi(irq.hw_index);
        }
    }

    let ret = port.handle_interrupt();
    let fired = sink.take();
    slog::info!(log, "dispatch complete";
        "result" => ?ret, "fired" => fired.len());
    for irq in fired {
        println!("{irq}");
    }

    port.detach();
    Ok(())
}
