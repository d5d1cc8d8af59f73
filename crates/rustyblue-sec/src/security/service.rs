//! Service security registry

use super::constants::*;
use crate::error::{SecError, SecResult};
use crate::l2cap::{is_valid_psm, psm_name, PSM_SDP};
use log::{debug, warn};

/// Security requirements registered for one service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSecurityRecord {
    pub psm: u16,
    pub mx_proto_id: u32,
    pub orig_mx_chan_id: u32,
    pub term_mx_chan_id: u32,
    pub service_id: u8,
    /// Requirement bits plus `SEC_IN_USE`
    pub security_flags: u16,
    pub orig_service_name: String,
    pub term_service_name: String,
}

impl ServiceSecurityRecord {
    pub fn in_use(&self) -> bool {
        self.security_flags & SEC_IN_USE != 0
    }

    fn matches_name(&self, name: &str) -> bool {
        self.orig_service_name == name || self.term_service_name == name
    }
}

/// Parameters of a service registration
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistration<'a> {
    pub is_originator: bool,
    pub name: &'a str,
    pub service_id: u8,
    pub sec_level: u16,
    pub psm: u16,
    pub mx_proto_id: u32,
    pub mx_chan_id: u32,
}

/// Fixed size table of service records
pub struct ServiceRegistry {
    records: Vec<ServiceSecurityRecord>,
    /// Most recent originator registration
    out_service: Option<usize>,
}

fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_SERVICE_NAME_LEN).collect()
}

impl ServiceRegistry {
    /// Create a registry with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            records: vec![ServiceSecurityRecord::default(); capacity],
            out_service: None,
        }
    }

    /// Insert or update a service record.
    ///
    /// A record with the same PSM, protocol id, service id and name is reused;
    /// otherwise the first free slot is taken.
    pub fn set_security_level(&mut self, reg: &ServiceRegistration<'_>, ssp_mode: bool) -> SecResult<()> {
        if !is_valid_psm(reg.psm) {
            warn!("Service {} registered on invalid psm 0x{:04x}", reg.service_id, reg.psm);
        }
        let name = truncate_name(reg.name);

        let existing = self.records.iter().position(|srec| {
            srec.in_use()
                && srec.psm == reg.psm
                && srec.mx_proto_id == reg.mx_proto_id
                && srec.service_id == reg.service_id
                && srec.matches_name(&name)
        });
        let index = match existing.or_else(|| self.records.iter().position(|srec| !srec.in_use())) {
            Some(index) => index,
            None => {
                warn!("Out of service security records");
                return Err(SecError::NoServiceRecords);
            }
        };

        let srec = &mut self.records[index];
        srec.psm = reg.psm;
        srec.service_id = reg.service_id;
        srec.mx_proto_id = reg.mx_proto_id;

        let mut sec_level = reg.sec_level;
        if reg.is_originator {
            srec.orig_mx_chan_id = reg.mx_chan_id;
            srec.orig_service_name = name;
            srec.security_flags &= !(SEC_OUT_ENCRYPT | SEC_OUT_AUTHENTICATE | SEC_OUT_MITM);

            sec_level &= !(SEC_IN_ENCRYPT | SEC_IN_AUTHENTICATE | SEC_IN_MITM | SEC_IN_MIN_16_DIGIT_PIN);
            if ssp_mode && sec_level & SEC_OUT_AUTHENTICATE != 0 {
                sec_level |= SEC_OUT_MITM;
            }
            if sec_level & SEC_OUT_ENCRYPT != 0 {
                sec_level |= SEC_OUT_AUTHENTICATE;
            }
            self.out_service = Some(index);
        } else {
            srec.term_mx_chan_id = reg.mx_chan_id;
            srec.term_service_name = name;
            srec.security_flags &=
                !(SEC_IN_ENCRYPT | SEC_IN_AUTHENTICATE | SEC_IN_MITM | SEC_IN_MIN_16_DIGIT_PIN);

            sec_level &= !(SEC_OUT_ENCRYPT | SEC_OUT_AUTHENTICATE | SEC_OUT_MITM);
            if ssp_mode && sec_level & SEC_IN_AUTHENTICATE != 0 {
                sec_level |= SEC_IN_MITM;
            }
            if sec_level & SEC_IN_ENCRYPT != 0 {
                sec_level |= SEC_IN_AUTHENTICATE;
            }
        }

        srec.security_flags |= sec_level | SEC_IN_USE;
        debug!(
            "Service {} psm 0x{:04x} ({}) registered, security 0x{:04x}",
            reg.service_id,
            reg.psm,
            psm_name(reg.psm),
            srec.security_flags
        );
        Ok(())
    }

    /// First record serving a PSM, the outgoing service winning for originators
    pub fn find_first(&self, is_originator: bool, psm: u16) -> Option<&ServiceSecurityRecord> {
        if is_originator {
            if let Some(srec) = self.out_service.map(|index| &self.records[index]) {
                if srec.in_use() && srec.psm == psm {
                    return Some(srec);
                }
            }
        }
        self.records.iter().find(|srec| srec.in_use() && srec.psm == psm)
    }

    /// Free all records with a service id, or every record for id 0. SDP is kept.
    pub fn clear_service(&mut self, service_id: u8) -> u8 {
        self.clear_matching(|srec| {
            srec.psm != PSM_SDP && (service_id == 0 || srec.service_id == service_id)
        })
    }

    /// Free all records for a PSM
    pub fn clear_service_by_psm(&mut self, psm: u16) -> u8 {
        self.clear_matching(|srec| srec.psm == psm)
    }

    fn clear_matching<F>(&mut self, filter: F) -> u8
    where
        F: Fn(&ServiceSecurityRecord) -> bool,
    {
        let mut freed = 0u8;
        for (index, srec) in self.records.iter_mut().enumerate() {
            if srec.in_use() && filter(srec) {
                debug!("Clearing service record psm 0x{:04x} id {}", srec.psm, srec.service_id);
                *srec = ServiceSecurityRecord::default();
                if self.out_service == Some(index) {
                    self.out_service = None;
                }
                freed = freed.saturating_add(1);
            }
        }
        freed
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceSecurityRecord> {
        self.records.iter().filter(|srec| srec.in_use())
    }
}
