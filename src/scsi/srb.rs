// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::scsi::constants::*;

/// SCSI addressing triple identifying one logical unit on the adapter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScsiAddress {
    pub bus: u8,
    pub target: u8,
    pub lun: u8,
}

impl ScsiAddress {
    pub fn new(bus: u8, target: u8, lun: u8) -> ScsiAddress {
        ScsiAddress { bus, target, lun }
    }
}

impl std::fmt::Display for ScsiAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.bus, self.target, self.lun)
    }
}

/// The request classes the host storage port submits to the adapter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SrbFunction {
    ExecuteScsi,
    AbortCommand,
    ResetLogicalUnit,
    ResetDevice,
    ResetBus,
    Flush,
    Shutdown,
    Pnp,
    IoControl,
}

/// Sense code triple, optionally carrying the information field.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: Option<u64>,
}

impl SenseData {
    pub fn new(key: u8, asc: u8, ascq: u8) -> SenseData {
        SenseData {
            key,
            asc,
            ascq,
            information: None,
        }
    }

    /// Serializes into fixed-format sense data (SPC-3 response code 0x70).
    pub fn to_fixed_format(self) -> [u8; SENSE_BUFFER_SIZE] {
        let mut sense = [0u8; SENSE_BUFFER_SIZE];
        // Response code 0x70: current errors, fixed format.
        sense[0] = 0x70;
        sense[2] = self.key;
        if let Some(information) = self.information {
            // The fixed-format information field is only 4 bytes wide.
            sense[3..7].copy_from_slice(&(information as u32).to_be_bytes());
            // Valid bit.
            sense[0] |= 0x80;
        }
        // Additional sense length: bytes following this one.
        sense[7] = (SENSE_BUFFER_SIZE - 8) as u8;
        sense[12] = self.asc;
        sense[13] = self.ascq;
        sense
    }
}

/// Size of the fixed-format sense buffer carried by each SRB.
pub const SENSE_BUFFER_SIZE: usize = 18;

/// A SCSI Request Block.
///
/// Submitted by the host storage port through [`crate::Adapter::start_io`] and
/// owned by the pipeline until handed back through
/// [`crate::StoragePort::request_complete`], exactly once.
#[derive(Debug)]
pub struct Srb {
    function: SrbFunction,
    address: ScsiAddress,
    cdb: [u8; 16],
    data: Vec<u8>,
    data_transfer_length: u32,
    srb_status: u8,
    scsi_status: u8,
    sense: [u8; SENSE_BUFFER_SIZE],
    disable_autosense: bool,
    pnp_adapter_request: bool,
}

impl Srb {
    /// Creates an EXECUTE_SCSI request carrying `cdb` and a data buffer of
    /// `data_len` zero bytes (filled by the caller for writes, by the backend
    /// for reads).
    pub fn execute_scsi(address: ScsiAddress, cdb: &[u8], data_len: usize) -> Srb {
        let mut srb = Srb::with_function(SrbFunction::ExecuteScsi, address);
        assert!(cdb.len() <= srb.cdb.len());
        srb.cdb[..cdb.len()].copy_from_slice(cdb);
        srb.data = vec![0; data_len];
        srb.data_transfer_length = data_len as u32;
        srb
    }

    pub fn with_function(function: SrbFunction, address: ScsiAddress) -> Srb {
        Srb {
            function,
            address,
            cdb: [0; 16],
            data: Vec::new(),
            data_transfer_length: 0,
            srb_status: SRB_STATUS_PENDING,
            scsi_status: GOOD,
            sense: [0; SENSE_BUFFER_SIZE],
            disable_autosense: false,
            pnp_adapter_request: false,
        }
    }

    pub fn function(&self) -> SrbFunction {
        self.function
    }

    pub fn address(&self) -> ScsiAddress {
        self.address
    }

    pub fn cdb(&self) -> &[u8; 16] {
        &self.cdb
    }

    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Installs the data buffer for request types whose constructor does not
    /// size one, such as PNP capability queries.
    pub fn set_data_buffer(&mut self, data: Vec<u8>) {
        self.data_transfer_length = data.len() as u32;
        self.data = data;
    }

    /// The number of valid bytes in the data buffer; the full buffer size on
    /// submission, possibly reduced on completion.
    pub fn data_transfer_length(&self) -> u32 {
        self.data_transfer_length
    }

    pub fn set_data_transfer_length(&mut self, len: u32) {
        self.data_transfer_length = len;
    }

    pub fn srb_status(&self) -> u8 {
        self.srb_status
    }

    pub fn set_srb_status(&mut self, status: u8) {
        self.srb_status = status;
    }

    pub fn scsi_status(&self) -> u8 {
        self.scsi_status
    }

    pub fn sense_buffer(&self) -> &[u8; SENSE_BUFFER_SIZE] {
        &self.sense
    }

    pub fn autosense_valid(&self) -> bool {
        self.srb_status & SRB_STATUS_AUTOSENSE_VALID != 0
    }

    pub fn set_disable_autosense(&mut self, disable: bool) {
        self.disable_autosense = disable;
    }

    pub fn pnp_adapter_request(&self) -> bool {
        self.pnp_adapter_request
    }

    pub fn set_pnp_adapter_request(&mut self, adapter_request: bool) {
        self.pnp_adapter_request = adapter_request;
    }

    /// Fails the request with `srb_status`, optionally raising
    /// CHECK_CONDITION with autosense data (suppressed when the host port
    /// disabled autosense for this SRB).
    pub fn fail(&mut self, srb_status: u8, sense: Option<SenseData>) {
        self.data_transfer_length = 0;
        self.srb_status = srb_status;
        if let Some(sense) = sense {
            self.scsi_status = CHECK_CONDITION;
            if !self.disable_autosense {
                self.sense = sense.to_fixed_format();
                self.srb_status |= SRB_STATUS_AUTOSENSE_VALID;
            }
        }
    }

    /// Fails the request with CHECK_CONDITION and, unless autosense is
    /// suppressed, fills the autosense buffer from `sense`.
    pub fn set_check_condition(&mut self, sense: SenseData) {
        self.fail(SRB_STATUS_ERROR, Some(sense));
    }

    /// Copies `payload` to the front of the data buffer, truncating to the
    /// buffer size, and returns the number of bytes copied.
    pub fn write_data(&mut self, payload: &[u8]) -> usize {
        let len = payload.len().min(self.data.len());
        self.data[..len].copy_from_slice(&payload[..len]);
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_condition_sets_autosense() {
        let mut srb = Srb::execute_scsi(ScsiAddress::new(0, 0, 0), &[WRITE_10], 512);
        srb.set_check_condition(SenseData::new(ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB, 0));
        assert_eq!(srb.scsi_status(), CHECK_CONDITION);
        assert!(srb.autosense_valid());
        assert_eq!(srb_status_code(srb.srb_status()), SRB_STATUS_ERROR);
        let sense = srb.sense_buffer();
        assert_eq!(sense[0], 0x70);
        assert_eq!(sense[2], ILLEGAL_REQUEST);
        assert_eq!(sense[12], ASC_INVALID_FIELD_IN_CDB);
        assert_eq!(srb.data_transfer_length(), 0);
    }

    #[test]
    fn check_condition_suppressed_autosense() {
        let mut srb = Srb::execute_scsi(ScsiAddress::new(0, 0, 0), &[WRITE_10], 0);
        srb.set_disable_autosense(true);
        srb.set_check_condition(SenseData::new(ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0));
        assert!(!srb.autosense_valid());
        assert_eq!(srb.srb_status(), SRB_STATUS_ERROR);
    }

    #[test]
    fn sense_information_field() {
        let sense = SenseData {
            key: MEDIUM_ERROR,
            asc: 0x11,
            ascq: 0,
            information: Some(0x1234),
        }
        .to_fixed_format();
        assert_eq!(sense[0], 0xf0);
        assert_eq!(&sense[3..7], &0x1234u32.to_be_bytes());
    }
}
