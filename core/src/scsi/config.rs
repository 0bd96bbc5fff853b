//! Board and initiator configuration

use serde::{Deserialize, Serialize};

/// Bus timing parameters, all in nanoseconds unless noted otherwise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhyTiming {
    /// Settle time after changing MSG/CD/IO
    pub bus_settle_ns: u32,
    /// Extra settle time when the I/O direction changes
    pub data_release_ns: u32,
    /// Data setup before asserting REQ/ACK (async transfers)
    pub data_setup_ns: u32,
    /// Waited before entering a data phase with a SCSI-1 host
    pub scsi1_data_phase_ns: u32,
    /// Added to every phase change settle time with a SCSI-1 host
    pub scsi1_phase_settle_ns: u32,
    /// Extra delay before releasing the bus with a SCSI-1 host
    pub scsi1_bus_free_ns: u32,
    /// Bus clear delay after going bus free
    pub bus_clear_ns: u32,
    /// Time from driving BSY until ATN is valid to sample
    pub sel_io_enable_ns: u32,
    /// Re-sample delay of the RST glitch filter
    pub rst_glitch_filter_ns: u32,
    /// Hold-off after a bus reset before accepting selections
    pub reset_holdoff_ns: u32,
    /// Selection is abandoned if SEL is still asserted after this (ms)
    pub selection_abort_ms: u32,
}

impl Default for PhyTiming {
    fn default() -> Self {
        Self {
            bus_settle_ns: 400,
            data_release_ns: 400,
            data_setup_ns: 100,
            scsi1_data_phase_ns: 400_000,
            scsi1_phase_settle_ns: 100_000,
            scsi1_bus_free_ns: 2_000,
            bus_clear_ns: 800,
            sel_io_enable_ns: 100,
            rst_glitch_filter_ns: 500,
            reset_holdoff_ns: 2_000_000,
            selection_abort_ms: 250,
        }
    }
}

/// Synchronous/wide transfer capabilities of this board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncLimits {
    /// Accept SDTR requests at all
    pub allow_sync: bool,
    /// Largest REQ/ACK offset we can track
    pub max_offset: u8,
    /// Fastest period we can run, in 4 ns units
    pub min_period: u8,
    /// Slower requests than this are answered with async
    pub max_period: u8,
    /// 16-bit data path available
    pub wide_capable: bool,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            allow_sync: true,
            max_offset: 15,
            // 100 ns, 10 MB/s
            min_period: 25,
            max_period: 80,
            wide_capable: false,
        }
    }
}

/// Target board configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Report parity errors in Command/DataOut/MessageOut
    pub enable_parity: bool,
    /// Treat hosts selecting with ATN as SCSI-2
    pub enable_scsi2: bool,
    /// Report UNIT ATTENTION after a reset
    pub enable_unit_attention: bool,
    /// Delay after selection before driving the bus. None: 1 ms for
    /// SCSI-1 hosts, none otherwise.
    pub selection_delay_ms: Option<u32>,
    pub sync: SyncLimits,
    pub timing: PhyTiming,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            enable_parity: true,
            enable_scsi2: true,
            enable_unit_attention: false,
            selection_delay_ms: None,
            sync: SyncLimits::default(),
            timing: PhyTiming::default(),
        }
    }
}

/// SDTR request sent by the initiator after IDENTIFY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Transfer period in 4 ns units
    pub period: u8,
    pub offset: u8,
}

/// Initiator (host/bridge role) configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitiatorConfig {
    pub own_id: u8,
    /// Give up on selection after this long
    pub selection_timeout_us: u32,
    /// BSY poll interval during selection
    pub selection_poll_us: u32,
    /// Select with ATN and send IDENTIFY
    pub assert_atn: bool,
    /// IDENTIFY message sent in MessageOut
    pub identify: u8,
    /// Negotiate synchronous transfers after IDENTIFY
    pub sync_request: Option<SyncRequest>,
    /// Check parity on bytes received from the target
    pub check_parity: bool,
    pub data_setup_ns: u32,
    /// Length of the RST pulse in `bus_reset`
    pub rst_pulse_us: u32,
    /// Wait after releasing RST
    pub reset_recovery_ms: u32,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            own_id: 7,
            selection_timeout_us: 250_000,
            selection_poll_us: 100,
            assert_atn: false,
            identify: crate::scsi::msg::IDENTIFY,
            sync_request: None,
            check_parity: false,
            data_setup_ns: 100,
            rst_pulse_us: 100,
            reset_recovery_ms: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_board_config() {
        let cfg: BoardConfig = serde_json::from_str(
            r#"{ "enable_parity": false, "timing": { "rst_glitch_filter_ns": 1000 } }"#,
        )
        .unwrap();
        assert!(!cfg.enable_parity);
        assert!(cfg.enable_scsi2);
        assert_eq!(cfg.timing.rst_glitch_filter_ns, 1000);
        assert_eq!(cfg.timing.bus_settle_ns, 400);
        assert_eq!(cfg.sync, SyncLimits::default());
    }

    #[test]
    fn initiator_config_sync_request() {
        let cfg: InitiatorConfig =
            serde_json::from_str(r#"{ "own_id": 6, "sync_request": { "period": 50, "offset": 8 } }"#)
                .unwrap();
        assert_eq!(cfg.own_id, 6);
        assert_eq!(
            cfg.sync_request,
            Some(SyncRequest {
                period: 50,
                offset: 8
            })
        );
        assert_eq!(cfg.selection_timeout_us, 250_000);
    }
}
