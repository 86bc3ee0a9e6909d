//! Simulated hardware: flash, backup registers and a LoRaWAN network.

use std::collections::{HashMap, VecDeque};

use lora_node_firmware::config::storage::{FLASH_REGION_SIZE, REGISTER_COUNT};
use lora_node_firmware::config::uplink::MAX_DOWNLINK;
use lora_node_firmware::mac::{Downlink, MacError, MacEvent, MacStack};
use lora_node_firmware::storage::{ByteStore, RegisterBank, SessionKeys, StorageError};

/// Flash region holding the durable record.
#[derive(Clone)]
pub struct SimFlash {
    bytes: Vec<u8>,
    pub writes: usize,
}

impl SimFlash {
    pub fn new() -> Self {
        Self {
            bytes: vec![0xFF; FLASH_REGION_SIZE as usize],
            writes: 0,
        }
    }

    /// Invert a byte range, as a bit-rot or interrupted erase would.
    pub fn corrupt(&mut self, offset: usize, len: usize) {
        for byte in &mut self.bytes[offset..offset + len] {
            *byte = !*byte;
        }
    }

    fn range(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, StorageError> {
        let start = offset as usize;
        let end = start + len;
        if end > self.bytes.len() {
            return Err(StorageError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl ByteStore for SimFlash {
    fn read_bytes(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> Result<(), StorageError> {
        let range = self.range(offset, bytes.len())?;
        self.bytes[range].copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }
}

/// Backup registers in a power domain that can be lost.
#[derive(Clone)]
pub struct SimRegisters {
    regs: [u32; REGISTER_COUNT],
}

impl SimRegisters {
    /// Registers as found after the first power-on.
    pub fn new() -> Self {
        let mut regs = Self { regs: [0; REGISTER_COUNT] };
        regs.power_loss();
        regs
    }

    /// Drop the backup domain. Contents come back as junk.
    pub fn power_loss(&mut self) {
        for (i, reg) in self.regs.iter_mut().enumerate() {
            *reg = 0x5A5A_0000 ^ (i as u32).wrapping_mul(0x9E37_79B9);
        }
    }
}

impl RegisterBank for SimRegisters {
    fn unlock(&mut self) {}

    fn read(&self, id: u8) -> u32 {
        self.regs.get(id as usize).copied().unwrap_or(0)
    }

    fn write(&mut self, id: u8, value: u32) {
        if let Some(reg) = self.regs.get_mut(id as usize) {
            *reg = value;
        }
    }
}

/// Network server view: sessions and the uplinks it accepted.
#[derive(Default)]
pub struct Network {
    next_dev_addr: u32,
    /// Highest accepted counter per device address
    last_counter: HashMap<u32, u32>,
    pub joins: usize,
    pub accepted: usize,
    /// Uplinks dropped as replays (counter not above the last accepted one)
    pub replays: usize,
}

impl Network {
    fn join(&mut self) -> SessionKeys {
        self.joins += 1;
        self.next_dev_addr += 1;
        let dev_addr = 0x2600_0000 | self.next_dev_addr;
        SessionKeys {
            dev_addr,
            nwk_s_key: [dev_addr as u8; 16],
            app_s_key: [(dev_addr >> 8) as u8; 16],
        }
    }

    fn uplink(&mut self, dev_addr: u32, counter: u32) -> bool {
        match self.last_counter.get(&dev_addr) {
            Some(&last) if counter <= last => {
                self.replays += 1;
                false
            }
            _ => {
                self.last_counter.insert(dev_addr, counter);
                self.accepted += 1;
                true
            }
        }
    }
}

/// MAC stack talking to the simulated network for one boot.
pub struct SimMac<'a> {
    network: &'a mut Network,
    session: Option<SessionKeys>,
    events: VecDeque<MacEvent>,
    /// Report a pending operation for this boot
    pub busy: bool,
    /// Fail join attempts during this boot
    pub fail_join: bool,
    /// Attach a downlink to the uplink completion
    pub downlink: bool,
    pub uplinks: Vec<u32>,
}

impl<'a> SimMac<'a> {
    pub fn new(network: &'a mut Network) -> Self {
        Self {
            network,
            session: None,
            events: VecDeque::new(),
            busy: false,
            fail_join: false,
            downlink: false,
            uplinks: Vec::new(),
        }
    }
}

impl MacStack for SimMac<'_> {
    fn is_busy(&self) -> bool {
        self.busy
    }

    async fn request_join(&mut self) -> Result<(), MacError> {
        let event = if self.fail_join {
            MacEvent::JoinFailed
        } else {
            let keys = self.network.join();
            self.session = Some(keys);
            MacEvent::JoinComplete(keys)
        };
        self.events.push_back(event);
        Ok(())
    }

    async fn restore_session(&mut self, keys: &SessionKeys, _counter: u32) -> Result<(), MacError> {
        self.session = Some(*keys);
        Ok(())
    }

    async fn queue_transmit(&mut self, _payload: &[u8], counter: u32) -> Result<(), MacError> {
        let keys = self.session.ok_or(MacError::Rejected)?;
        let ack = self.network.uplink(keys.dev_addr, counter);
        self.uplinks.push(counter);

        let downlink = if self.downlink {
            let mut data: heapless::Vec<u8, MAX_DOWNLINK> = heapless::Vec::new();
            let _ = data.extend_from_slice(&counter.to_be_bytes());
            Some(Downlink { port: 2, data })
        } else {
            None
        };
        self.events.push_back(MacEvent::TransmitComplete {
            counter: counter.wrapping_add(1),
            ack,
            downlink,
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<MacEvent, MacError> {
        self.events.pop_front().ok_or(MacError::Link)
    }
}
