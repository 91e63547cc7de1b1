// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridge and controller register map.

// Controller APB block

pub const CTRL_SEC_ERROR_INT: usize = 0x28;
pub const CTRL_SEC_ERROR_INT_MASK: usize = 0x2c;
pub const CTRL_DED_ERROR_INT: usize = 0x30;
pub const CTRL_DED_ERROR_INT_MASK: usize = 0x34;
pub const CTRL_ECC_CONTROL: usize = 0x38;
pub const CTRL_LTSSM_STATE: usize = 0x5c;
pub const CTRL_PCIE_EVENT_INT: usize = 0x14c;

pub const LEN_CTRL: usize = 0x1000;

/// Written to the single/double error interrupt and mask registers to clear
/// and mask every source.
pub const ERROR_INT_ALL: u32 = 0xffff;
/// Disables ECC on all four controller RAMs.
pub const ECC_CONTROL_DISABLE: u32 = 0x0f00_0000;
/// Clears and masks the link, flush and DLUP events.
pub const PCIE_EVENT_INT_ALL: u32 = 0x0007_0007;

pub const LTSSM_STATE_MASK: u32 = 0x3f;
/// LTSSM encoding of the L0 operational state.
pub const LTSSM_L0: u32 = 0x10;

// Bridge APB block

pub const BRIDGE_PCIE_PCI_IDS_DW1: usize = 0x9c;
pub const BRIDGE_IMASK_LOCAL: usize = 0x180;
pub const BRIDGE_ISTATUS_LOCAL: usize = 0x184;
pub const BRIDGE_IMASK_HOST: usize = 0x188;
pub const BRIDGE_ISTATUS_HOST: usize = 0x18c;
/// Target of device MSI writes; the register offset doubles as the
/// message address.
pub const BRIDGE_MSI_MSG_ADDR: usize = 0x190;
pub const BRIDGE_ISTATUS_MSI: usize = 0x194;

pub const BRIDGE_PCIE_WIN0_PARAM: usize = 0x600;
pub const BRIDGE_PCIE_WIN0_ADDR: usize = 0x604;
/// Window 0 enable plus the largest size encoding: pass every inbound
/// transaction through untranslated.
pub const PCIE_WIN0_PASSTHRU: u32 = 0x3e;

pub const BRIDGE_ATR0_BASE: usize = 0x800;
pub const ATR_STRIDE: usize = 0x20;

// Offsets within one ATR entry
pub const ATR_SRCADDR_PARAM: usize = 0x00;
pub const ATR_SRC_ADDR: usize = 0x04;
pub const ATR_TRSL_ADDR_LSB: usize = 0x08;
pub const ATR_TRSL_ADDR_UDW: usize = 0x0c;
pub const ATR_TRSL_PARAM: usize = 0x10;

pub const ATR_ENABLE: u32 = 1 << 0;
pub const ATR_SIZE_SHIFT: u32 = 1;
pub const ATR_SIZE_MASK: u32 = 0x3f << ATR_SIZE_SHIFT;
/// Source address bits carried in SRCADDR_PARAM.
pub const ATR_SRC_ADDR_LO_MASK: u32 = !0xfff;

/// TRSL_PARAM: route the window to the configuration interface.
pub const TRSL_ID_CONFIG: u32 = 1;
/// TRSL_PARAM: route the window to the PCIe TX/RX interface.
pub const TRSL_ID_TXRX: u32 = 0;

/// Covers every ATR entry the bridge can carry.
pub const LEN_BRIDGE: usize = 0x1000;

bitflags! {
    /// Local interrupt status and mask bits this driver handles.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct LocalIntr: u32 {
        const INTA = 1 << 24;
        const INTB = 1 << 25;
        const INTC = 1 << 26;
        const INTD = 1 << 27;
        const MSI = 1 << 28;

        const INTX = Self::INTA.bits()
            | Self::INTB.bits()
            | Self::INTC.bits()
            | Self::INTD.bits();
    }
}

/// First bit of the INTx field in the local status register.
pub const LOCAL_INTX_SHIFT: u32 = 24;

/// Value of IMASK_LOCAL once the bridge is ready to deliver interrupts.
pub const IMASK_LOCAL_ENABLE: u32 =
    LocalIntr::INTX.bits() | LocalIntr::MSI.bits();

// Root port's own configuration header, reached through the ECAM block

pub const ECAM_MSI_CAP_CTRL: usize = 0xe0;
pub const ECAM_MSI_MSG_ADDR: usize = 0xe4;

pub const MSI_CAP_ENABLE: u32 = 1 << 16;
/// ORed into the root port's MSI control dword: enable, plus the vector
/// count the bridge advertises.
pub const MSI_CAP_CTRL_ENABLE: u32 = (32 << 20) | MSI_CAP_ENABLE;
