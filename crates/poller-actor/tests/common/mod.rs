#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use modbus_client::{ClientError, RegisterSource};
use types::RegisterKind;

/// In-memory stand-in for a Cerbo GX. Missing registers answer with
/// "illegal data address", offline units with "gateway target failed".
#[derive(Default)]
pub struct FakeGateway {
    registers: Mutex<HashMap<(u8, RegisterKind, u16), u16>>,
    offline_units: Mutex<HashSet<u8>>,
    requests: Mutex<Vec<(u8, RegisterKind, u16)>>,
    link_down: AtomicBool,
    reconnect_fails: AtomicBool,
    reconnects: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, unit: u8, kind: RegisterKind, address: u16, words: &[u16]) {
        let mut registers = self.registers.lock().expect("registers");
        for (offset, word) in words.iter().enumerate() {
            registers.insert((unit, kind, address + offset as u16), *word);
        }
    }

    pub fn set_holding(&self, unit: u8, address: u16, words: &[u16]) {
        self.set(unit, RegisterKind::Holding, address, words);
    }

    pub fn set_offline(&self, unit: u8, offline: bool) {
        let mut units = self.offline_units.lock().expect("units");
        if offline {
            units.insert(unit);
        } else {
            units.remove(&unit);
        }
    }

    pub fn set_link_down(&self, down: bool) {
        self.link_down.store(down, Ordering::SeqCst);
    }

    pub fn set_reconnect_fails(&self, fails: bool) {
        self.reconnect_fails.store(fails, Ordering::SeqCst);
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(u8, RegisterKind, u16)> {
        self.requests.lock().expect("requests").clone()
    }

    /// Populates every register of the built-in map with plausible values.
    pub fn populate_cerbo(&self) {
        self.set_holding(100, 820, &[(-150i16) as u16, 200, 0]);
        self.set_holding(30, 2644, &[5001]);
        self.set(227, RegisterKind::Input, 3, &[2305, 2298, 2311]);
        self.set_holding(100, 817, &[410, 95, 0]);
        self.set_holding(100, 840, &[532, (-20i16) as u16]);
        self.set_holding(100, 843, &[87]);
        self.set_holding(225, 262, &[253]);
        self.set_holding(20, 1052, &[0x0000, 0x04D2]);
    }
}

impl RegisterSource for FakeGateway {
    async fn read_registers(
        &self,
        unit_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        self.requests
            .lock()
            .expect("requests")
            .push((unit_id, kind, start));
        if self.link_down.load(Ordering::SeqCst) {
            return Err(ClientError::Timeout { timeout_ms: 1 });
        }
        if self.offline_units.lock().expect("units").contains(&unit_id) {
            return Err(ClientError::Exception {
                unit_id,
                start,
                code: 0x0B,
            });
        }
        let registers = self.registers.lock().expect("registers");
        (0..count)
            .map(|offset| {
                registers
                    .get(&(unit_id, kind, start + offset))
                    .copied()
                    .ok_or(ClientError::Exception {
                        unit_id,
                        start,
                        code: 0x02,
                    })
            })
            .collect()
    }

    async fn reconnect(&self) -> Result<(), ClientError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.reconnect_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            )));
        }
        self.link_down.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub fn assert_close(actual: Option<f64>, expected: f64) {
    let actual = actual.expect("value present");
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}
