/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! In-process stand-ins for a BootROM and its ports, used by the unit tests.
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use sha2::{Digest, Sha256};

use crate::connection::{Channel, ChannelConfig, Connection};
use crate::connection::command::{ACK, BAUD_SYNC, HANDSHAKE_SEQ, HANDSHAKE_START, NACK};
use crate::connection::port::{ConnectionType, MTKPort};
use crate::core::chip::{ChipProfile, PUBK_LEN, PUBK_OFFSET};
use crate::core::crypto::config::CryptoIO;
use crate::core::crypto::gcpu::{DEFAULT_SETUP_IV, MTEE_LABEL, PREDETERMINED_KEY_SLOT};
use crate::error::{Error, Result, TransportError};
use crate::exploit::DeviceConnector;
use crate::utilities::CancelToken;
use crate::utilities::bytes::{from_words, to_words};

const FALLBACK_GCPU_BASE: u32 = 0x1005_0000;
const FALLBACK_SEJ_BASE: u32 = 0x1000_A000;
const GCPU_WINDOW: u32 = 0x1000;
const SEJ_WINDOW: u32 = 0x100;
const SCRATCH_OFFSET: u32 = 0xC00;
const SCRATCH_WORDS: usize = 0x100;

const DENIED_STATUS: u16 = 0x1D0C;
const TARGET_CONFIG: u32 = 0x5;
const DEFAULT_CONSTANT: u8 = 0x42;
const SERIAL_BAUD: u32 = 115_200;

const GCPU_HW_KEY: [u8; 16] = [
    0x0F, 0x1E, 0x2D, 0x3C, 0x4B, 0x5A, 0x69, 0x78, 0x87, 0x96, 0xA5, 0xB4, 0xC3, 0xD2, 0xE1, 0xF0,
];
const SEJ_HUK: [u8; 16] = *b"sim-hw-unique-k!";
const DEVINFO: (u32, u32) = (0x1234_5678, 0x9ABC_DEF0);

fn aes_ecb(key: &[u8], data: &[u8], encrypt: bool) -> Vec<u8> {
    let cipher = Aes128::new_from_slice(key).unwrap();
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(16) {
        let mut block = aes::Block::clone_from_slice(chunk);
        if encrypt {
            cipher.encrypt_block(&mut block);
        } else {
            cipher.decrypt_block(&mut block);
        }
        out.extend_from_slice(&block);
    }
    out
}

fn xor16(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

#[derive(Debug, Default)]
struct SimGcpu {
    regs: HashMap<u32, u32>,
    scratch: Vec<u32>,
    int_set: u32,
    mem_ptr: u32,
    engine_mem: HashMap<u32, u32>,
    mem_addr_history: Vec<u32>,
    fail_opcode: Option<u8>,
    hang: bool,
}

#[derive(Debug, Default)]
struct SimSej {
    regs: HashMap<u32, u32>,
    ready: bool,
}

impl SimSej {
    fn words(&self, offset: u32, count: u32) -> Vec<u32> {
        (0..count).map(|i| self.regs.get(&(offset + i * 4)).copied().unwrap_or(0)).collect()
    }

    fn set_words(&mut self, offset: u32, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            self.regs.insert(offset + i as u32 * 4, *w);
        }
    }

    fn key(&self) -> [u8; 16] {
        let otp = from_words(&self.words(0x60, 8));
        let digest = Sha256::new().chain_update(SEJ_HUK).chain_update(&otp).finalize();
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        key
    }

    fn run_block(&mut self) {
        let key = self.key();
        let encrypt = self.regs.get(&0x04).copied().unwrap_or(0) & 1 != 0;
        let iv = from_words(&self.words(0x40, 4));
        let input = from_words(&self.words(0x10, 4));

        let (out, chain) = if encrypt {
            let out = aes_ecb(&key, &xor16(&input, &iv), true);
            (out.clone(), out)
        } else {
            (xor16(&aes_ecb(&key, &input, false), &iv), input)
        };

        self.set_words(0x50, &to_words(&out));
        self.set_words(0x40, &to_words(&chain));
        self.ready = true;
    }

    fn write(&mut self, offset: u32, value: u32) {
        if offset == 0x08 {
            if value & 2 != 0 {
                self.ready = false;
                self.set_words(0x10, &[0; 4]);
                self.set_words(0x50, &[0; 4]);
            }
            if value & 1 != 0 {
                self.run_block();
            }
        }
        self.regs.insert(offset, value);
    }

    fn read(&self, offset: u32) -> u32 {
        match offset {
            0x08 if self.ready => 0x8000,
            0x08 => 0,
            _ => self.regs.get(&offset).copied().unwrap_or(0),
        }
    }
}

#[derive(Debug)]
enum Proto {
    Handshake(usize),
    Idle,
    Args { cmd: u8, buf: Vec<u8>, need: usize },
    WriteData { addr: u32, left: usize, buf: Vec<u8> },
    BaudArgs(usize),
    BaudAck,
    BaudSync,
    Payload { len: usize, data: Vec<u8> },
}

struct SimState {
    hw_code: u16,
    gcpu_base: u32,
    sej_base: u32,
    memory: HashMap<u32, u32>,
    gcpu: SimGcpu,
    sej: SimSej,
    meid: Vec<u8>,
    socid: Vec<u8>,
    prov_key: Vec<u8>,
    pubk: Vec<u8>,
    rom: Vec<u8>,

    proto: Proto,
    rx: VecDeque<u8>,
    denied: HashSet<u32>,
    refuse_baud: bool,
    reject_payload: bool,
    accepted: Option<u8>,
    payload: Option<Vec<u8>>,
    crashed: bool,
    reseats: usize,
}

impl SimState {
    fn new(hw_code: u16) -> Self {
        let profile = ChipProfile::from_hw_code(hw_code);
        let gcpu_base = profile.and_then(|p| p.gcpu_base).unwrap_or(FALLBACK_GCPU_BASE);
        let sej_base = profile.and_then(|p| p.sej_base).unwrap_or(FALLBACK_SEJ_BASE);

        let mut state = SimState {
            hw_code,
            gcpu_base,
            sej_base,
            memory: HashMap::new(),
            gcpu: SimGcpu { scratch: vec![0; SCRATCH_WORDS], ..Default::default() },
            sej: SimSej::default(),
            meid: (0..16).map(|i| 0xA0 ^ i as u8).collect(),
            socid: (0..32).map(|i| 0x30 + i as u8).collect(),
            prov_key: (0..16).map(|i| 0xC0 | i as u8).collect(),
            pubk: (0..PUBK_LEN).map(|i| (i as u8).wrapping_mul(0x1D) ^ 0x5A).collect(),
            rom: (0..0x400usize).map(|i| (i.wrapping_mul(7) ^ (i >> 8)) as u8).collect(),
            proto: Proto::Handshake(0),
            rx: VecDeque::new(),
            denied: HashSet::new(),
            refuse_baud: false,
            reject_payload: false,
            accepted: Some(profile.and_then(|p| p.known_constant).unwrap_or(DEFAULT_CONSTANT)),
            payload: None,
            crashed: false,
            reseats: 0,
        };

        let (meid_addr, socid_addr) = match profile {
            Some(p) => (p.meid_addr(), p.socid_addr()),
            None => (0x0010_08EC, 0x0010_0934),
        };
        state.store_bytes(meid_addr, &state.meid.clone());
        state.store_bytes(socid_addr, &state.socid.clone());

        if let Some(addr) = profile.and_then(|p| p.prov_addr) {
            state.store_bytes(addr, &state.prov_key.clone());
        }
        if let Some(efuse) = profile.and_then(|p| p.efuse_addr) {
            state.store_bytes(efuse + PUBK_OFFSET, &state.pubk.clone());
        }
        if let Some((lo, hi)) = profile.and_then(|p| p.devinfo_seed_addrs) {
            state.memory.insert(lo, DEVINFO.0);
            state.memory.insert(hi, DEVINFO.1);
        }

        let setup_block = aes_ecb(&[0; 16], &DEFAULT_SETUP_IV, true);
        state.store_bytes(0, &setup_block);
        state.store_bytes(0xD848, &setup_block);
        state
    }

    fn store_bytes(&mut self, addr: u32, data: &[u8]) {
        for (i, w) in to_words(data).iter().enumerate() {
            self.memory.insert(addr + i as u32 * 4, *w);
        }
    }

    fn load_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let words: Vec<u32> = (0..len.div_ceil(4) as u32)
            .map(|i| self.memory.get(&(addr + i * 4)).copied().unwrap_or(0))
            .collect();
        from_words(&words)
    }

    fn in_gcpu(&self, addr: u32) -> Option<u32> {
        (addr >= self.gcpu_base && addr < self.gcpu_base + GCPU_WINDOW).then(|| addr - self.gcpu_base)
    }

    fn in_sej(&self, addr: u32) -> Option<u32> {
        (addr >= self.sej_base && addr < self.sej_base + SEJ_WINDOW).then(|| addr - self.sej_base)
    }

    fn read(&mut self, addr: u32) -> u32 {
        if let Some(off) = self.in_gcpu(addr) {
            return self.gcpu_read(off);
        }
        if let Some(off) = self.in_sej(addr) {
            return self.sej.read(off);
        }
        self.memory.get(&addr).copied().unwrap_or(0)
    }

    fn write(&mut self, addr: u32, value: u32) {
        if let Some(off) = self.in_gcpu(addr) {
            return self.gcpu_write(off, value);
        }
        if let Some(off) = self.in_sej(addr) {
            return self.sej.write(off, value);
        }
        self.memory.insert(addr, value);
    }

    fn peek(&self, addr: u32) -> u32 {
        if let Some(off) = self.in_gcpu(addr) {
            if off >= SCRATCH_OFFSET {
                return self.gcpu.scratch[((off - SCRATCH_OFFSET) / 4) as usize];
            }
            return self.gcpu.regs.get(&off).copied().unwrap_or(0);
        }
        if let Some(off) = self.in_sej(addr) {
            return self.sej.read(off);
        }
        self.memory.get(&addr).copied().unwrap_or(0)
    }

    fn gcpu_read(&mut self, off: u32) -> u32 {
        let g = &mut self.gcpu;
        match off {
            0x408 => {
                let v = g.engine_mem.get(&g.mem_ptr).copied().unwrap_or(0);
                g.mem_ptr += 4;
                v
            }
            0x418 => 1,
            0x800 | 0x804 => g.int_set,
            o if o >= SCRATCH_OFFSET => g.scratch[((o - SCRATCH_OFFSET) / 4) as usize],
            o => g.regs.get(&o).copied().unwrap_or(0),
        }
    }

    fn gcpu_write(&mut self, off: u32, value: u32) {
        match off {
            0x400 => self.gcpu_exec(),
            0x404 => {
                self.gcpu.mem_addr_history.push(value);
                self.gcpu.mem_ptr = value & !(1 << 31);
            }
            0x408 => {
                let ptr = self.gcpu.mem_ptr;
                self.gcpu.engine_mem.insert(ptr, value);
                self.gcpu.mem_ptr += 4;
            }
            0x800 => {}
            0x804 => self.gcpu.int_set &= !value,
            o if o >= SCRATCH_OFFSET => {
                self.gcpu.scratch[((o - SCRATCH_OFFSET) / 4) as usize] = value;
            }
            o => {
                self.gcpu.regs.insert(o, value);
            }
        }
    }

    fn slot_bytes(&self, index: u32) -> Vec<u8> {
        let i = index as usize;
        from_words(&self.gcpu.scratch[i..i + 4])
    }

    fn set_slot_bytes(&mut self, index: u32, data: &[u8]) {
        let i = index as usize;
        for (n, w) in to_words(data).iter().enumerate() {
            self.gcpu.scratch[i + n] = *w;
        }
    }

    fn slot_key(&self, index: u32) -> Vec<u8> {
        if index == PREDETERMINED_KEY_SLOT {
            return GCPU_HW_KEY.to_vec();
        }
        self.slot_bytes(index)
    }

    fn gcpu_exec(&mut self) {
        if self.gcpu.hang {
            return;
        }

        let op = (self.gcpu.scratch[0] & 0xFF) as u8;
        if self.gcpu.fail_opcode == Some(op) {
            self.gcpu.int_set = 3;
            return;
        }

        let p = |n: usize| self.gcpu.scratch[1 + n];
        let (p0, p1, p2, p3, p4, p5) = (p(0), p(1), p(2), p(3), p(4), p(5));

        match op {
            0x70 => self.set_slot_bytes(p1, &GCPU_HW_KEY),
            0x76 | 0x78 | 0x77 | 0x79 => {
                let encrypt = op == 0x77 || op == 0x79;
                let out = aes_ecb(&self.slot_key(p1), &self.slot_bytes(p2), encrypt);
                self.set_slot_bytes(p3, &out);
            }
            0x7C..=0x7F => {
                let encrypt = op & 1 != 0;
                let key = self.slot_key(p4);
                let mut iv = self.slot_bytes(p5);
                for b in 0..p2 {
                    let input = self.load_bytes(p0 + b * 16, 16);
                    let out = if encrypt {
                        let out = aes_ecb(&key, &xor16(&input, &iv), true);
                        iv = out.clone();
                        out
                    } else {
                        let out = xor16(&aes_ecb(&key, &input, false), &iv);
                        iv = input;
                        out
                    };
                    self.store_bytes(p1 + b * 16, &out);
                }
            }
            0x7A | 0x7B => {
                let data = self.load_bytes(p0, p2 as usize * 16);
                let out = aes_ecb(&GCPU_HW_KEY, &data, op == 0x7B);
                self.store_bytes(p1, &out);
            }
            _ => {}
        }
        self.gcpu.int_set = 1;
    }

    fn reply(&mut self, data: &[u8]) {
        self.rx.extend(data);
    }

    fn feed(&mut self, byte: u8) {
        let proto = std::mem::replace(&mut self.proto, Proto::Idle);
        self.proto = match proto {
            Proto::Handshake(i) => {
                self.reply(&[!byte]);
                let next = if byte == HANDSHAKE_SEQ[i] {
                    i + 1
                } else if byte == HANDSHAKE_START {
                    1
                } else {
                    0
                };
                if next == HANDSHAKE_SEQ.len() { Proto::Idle } else { Proto::Handshake(next) }
            }
            Proto::Idle => self.command(byte),
            Proto::Args { cmd, mut buf, need } => {
                self.reply(&[byte]);
                buf.push(byte);
                if buf.len() == need { self.run_command(cmd, &buf) } else { Proto::Args { cmd, buf, need } }
            }
            Proto::WriteData { addr, left, mut buf } => {
                self.reply(&[byte]);
                buf.push(byte);
                if buf.len() < 4 {
                    Proto::WriteData { addr, left, buf }
                } else {
                    self.write(addr, u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
                    if left == 1 {
                        self.reply(&[0, 0]);
                        Proto::Idle
                    } else {
                        Proto::WriteData { addr: addr + 4, left: left - 1, buf: Vec::new() }
                    }
                }
            }
            Proto::BaudArgs(n) if n + 1 < 2 => Proto::BaudArgs(n + 1),
            Proto::BaudArgs(_) if self.refuse_baud => {
                self.reply(&[NACK]);
                Proto::Idle
            }
            Proto::BaudArgs(_) => {
                self.reply(&[ACK]);
                Proto::BaudAck
            }
            Proto::BaudAck if byte == ACK => Proto::BaudSync,
            Proto::BaudAck => Proto::Idle,
            Proto::BaudSync if byte == BAUD_SYNC => {
                self.reply(&[BAUD_SYNC]);
                Proto::BaudSync
            }
            Proto::BaudSync => {
                self.reply(&[ACK]);
                Proto::Idle
            }
            Proto::Payload { len, mut data } => {
                data.push(byte);
                if data.len() < len {
                    Proto::Payload { len, data }
                } else {
                    self.payload = Some(data);
                    self.reply(&[0, 0, 0, 0]);
                    Proto::Idle
                }
            }
        };
    }

    fn command(&mut self, byte: u8) -> Proto {
        match byte {
            0xD1 | 0xD4 => {
                self.reply(&[byte]);
                Proto::Args { cmd: byte, buf: Vec::new(), need: 8 }
            }
            0xE0 => {
                self.reply(&[byte]);
                Proto::Args { cmd: byte, buf: Vec::new(), need: 4 }
            }
            0xD2 => Proto::BaudArgs(0),
            0xFD => {
                self.reply(&[byte]);
                self.reply(&self.hw_code.to_be_bytes());
                self.reply(&[0, 0]);
                Proto::Idle
            }
            0xFC => {
                self.reply(&[byte, 0x8A, 0x00, 0xCA, 0x00, 0x00, 0x00, 0, 0]);
                Proto::Idle
            }
            0xD8 => {
                self.reply(&[byte]);
                self.reply(&TARGET_CONFIG.to_be_bytes());
                self.reply(&[0, 0]);
                Proto::Idle
            }
            0xE1 | 0xE7 => {
                let id = if byte == 0xE1 { self.meid.clone() } else { self.socid.clone() };
                self.reply(&[byte]);
                self.reply(&(id.len() as u32).to_be_bytes());
                self.reply(&id);
                self.reply(&[0, 0]);
                Proto::Idle
            }
            _ => {
                self.reply(&[byte]);
                Proto::Idle
            }
        }
    }

    fn run_command(&mut self, cmd: u8, args: &[u8]) -> Proto {
        let first = u32::from_be_bytes([args[0], args[1], args[2], args[3]]);
        match cmd {
            0xD1 => {
                if self.denied.contains(&first) {
                    self.reply(&DENIED_STATUS.to_be_bytes());
                    return Proto::Idle;
                }
                let count = u32::from_be_bytes([args[4], args[5], args[6], args[7]]);
                self.reply(&[0, 0]);
                for i in 0..count {
                    let word = self.read(first + i * 4);
                    self.reply(&word.to_be_bytes());
                }
                self.reply(&[0, 0]);
                Proto::Idle
            }
            0xD4 => {
                if self.denied.contains(&first) {
                    self.reply(&DENIED_STATUS.to_be_bytes());
                    return Proto::Idle;
                }
                let count = u32::from_be_bytes([args[4], args[5], args[6], args[7]]) as usize;
                self.reply(&[0, 0]);
                if count == 0 {
                    self.reply(&[0, 0]);
                    return Proto::Idle;
                }
                Proto::WriteData { addr: first, left: count, buf: Vec::new() }
            }
            _ => {
                if self.reject_payload {
                    self.reply(&DENIED_STATUS.to_le_bytes());
                    return Proto::Idle;
                }
                self.reply(&[0, 0]);
                if first == 0 {
                    self.payload = Some(Vec::new());
                    self.reply(&[0, 0, 0, 0]);
                    return Proto::Idle;
                }
                Proto::Payload { len: first as usize, data: Vec::new() }
            }
        }
    }

    fn trigger(&mut self, value: u16) -> bool {
        let accepted = self.payload.is_some() && self.accepted.is_some_and(|c| c as u16 == value);
        if accepted {
            let rom = self.rom.clone();
            self.reply(&(rom.len() as u32).to_be_bytes());
            self.reply(&rom);
        } else {
            self.crashed = true;
        }
        accepted
    }

    fn reseat(&mut self) {
        self.proto = Proto::Handshake(0);
        self.rx.clear();
        self.payload = None;
        self.crashed = false;
        self.reseats += 1;
    }
}

/// A simulated BootROM shared by every port and register window handed out.
#[derive(Clone)]
pub struct SimBrom {
    state: Arc<Mutex<SimState>>,
}

impl SimBrom {
    pub fn new(hw_code: u16) -> Self {
        SimBrom { state: Arc::new(Mutex::new(SimState::new(hw_code))) }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn port(&self) -> SimPort {
        SimPort { state: self.state.clone(), serial: false, baudrate: 0 }
    }

    pub fn serial_port(&self) -> SimPort {
        SimPort { state: self.state.clone(), serial: true, baudrate: SERIAL_BAUD }
    }

    /// Register access without the link, as if the exploit had already run.
    pub fn direct_io(&self) -> SimIo {
        SimIo { state: self.state.clone() }
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector { brom: self.clone() }
    }

    pub fn gcpu_base(&self) -> u32 {
        self.lock().gcpu_base
    }

    pub fn sej_base(&self) -> u32 {
        self.lock().sej_base
    }

    pub fn peek(&self, addr: u32) -> u32 {
        self.lock().peek(addr)
    }

    pub fn gcpu_mem_addr_history(&self) -> Vec<u32> {
        self.lock().gcpu.mem_addr_history.clone()
    }

    pub fn fail_opcode(&self, opcode: u8) {
        self.lock().gcpu.fail_opcode = Some(opcode);
    }

    pub fn hang_gcpu(&self) {
        self.lock().gcpu.hang = true;
    }

    pub fn gcpu_hw_key(&self) -> [u8; 16] {
        GCPU_HW_KEY
    }

    pub fn expected_mtee_label_key(&self) -> Vec<u8> {
        aes_ecb(&GCPU_HW_KEY, MTEE_LABEL, true)
    }

    /// AES key the SEJ currently derives from the loaded OTP.
    pub fn sej_key(&self) -> [u8; 16] {
        self.lock().sej.key()
    }

    pub fn devinfo_words(&self) -> (u32, u32) {
        DEVINFO
    }

    pub fn meid(&self) -> Vec<u8> {
        self.lock().meid.clone()
    }

    pub fn prov_key(&self) -> Vec<u8> {
        self.lock().prov_key.clone()
    }

    /// Public key hash seeded into the efuse block.
    pub fn pubk(&self) -> Vec<u8> {
        self.lock().pubk.clone()
    }

    pub fn rom(&self) -> Vec<u8> {
        self.lock().rom.clone()
    }

    pub fn payload_received(&self) -> Option<Vec<u8>> {
        self.lock().payload.clone()
    }

    pub fn reject_payload(&self) {
        self.lock().reject_payload = true;
    }

    /// Constant that makes the trigger hand control to the payload. `None` accepts nothing.
    pub fn accept_constant(&self, constant: Option<u8>) {
        self.lock().accepted = constant;
    }

    pub fn reseats(&self) -> usize {
        self.lock().reseats
    }

    pub fn deny_address(&self, addr: u32) {
        self.lock().denied.insert(addr);
    }

    pub fn refuse_baud_change(&self) {
        self.lock().refuse_baud = true;
    }
}

pub struct SimPort {
    state: Arc<Mutex<SimState>>,
    serial: bool,
    baudrate: u32,
}

impl fmt::Debug for SimPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimPort").field("serial", &self.serial).finish()
    }
}

#[async_trait::async_trait]
impl MTKPort for SimPort {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if !state.crashed {
            for &b in buf {
                state.feed(b);
            }
        }
        Ok(buf.len())
    }

    async fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.rx.is_empty() {
            return Err(TransportError::ReadTimeout { expected: buf.len(), got: 0 }.into());
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn pending(&mut self) -> Result<usize> {
        Ok(self.state.lock().unwrap().rx.len())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn set_baudrate(&mut self, baudrate: u32) -> Result<()> {
        self.baudrate = baudrate;
        Ok(())
    }

    async fn ctrl_out(&mut self, _: u8, _: u8, _: u16, _: u16, _: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn ctrl_in(&mut self, _: u8, _: u8, value: u16, _: u16, _: usize) -> Result<Vec<u8>> {
        if self.state.lock().unwrap().trigger(value) {
            Ok(Vec::new())
        } else {
            Err(Error::conn("Device stopped responding"))
        }
    }

    fn get_connection_type(&self) -> ConnectionType {
        ConnectionType::Brom
    }

    fn get_baudrate(&self) -> u32 {
        self.baudrate
    }

    fn get_port_name(&self) -> String {
        "SIM".to_string()
    }

    fn is_serial(&self) -> bool {
        self.serial
    }
}

pub struct SimIo {
    state: Arc<Mutex<SimState>>,
}

#[async_trait::async_trait]
impl CryptoIO for SimIo {
    async fn read32(&mut self, addr: u32) -> Result<u32> {
        Ok(self.state.lock().unwrap().read(addr))
    }

    async fn write32(&mut self, addr: u32, val: u32) -> Result<()> {
        self.state.lock().unwrap().write(addr, val);
        Ok(())
    }
}

/// Re-seats the simulated device and handshakes on a fresh port.
pub struct SimConnector {
    brom: SimBrom,
}

#[async_trait::async_trait]
impl DeviceConnector for SimConnector {
    async fn reconnect(&mut self, cancel: &CancelToken, config: &ChannelConfig) -> Result<Connection> {
        cancel.check()?;
        self.brom.lock().reseat();

        let channel = Channel::new(Box::new(self.brom.port())).with_config(config.clone());
        let mut conn = Connection::from_channel(channel);
        conn.connect().await?;
        Ok(conn)
    }
}

/// Port that replays queued bytes and records what was written.
#[derive(Debug, Default)]
pub struct ScriptedPort {
    rx: VecDeque<u8>,
    fragment: Option<usize>,
    fail_writes: usize,
    overflow: bool,
    log: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rx(mut self, data: &[u8]) -> Self {
        self.rx.extend(data);
        self
    }

    /// Caps how many bytes a single read returns.
    pub fn with_rx_fragment(mut self, len: usize) -> Self {
        self.fragment = Some(len);
        self
    }

    pub fn fail_writes(mut self, count: usize) -> Self {
        self.fail_writes = count;
        self
    }

    pub fn overflow_on_read(mut self) -> Self {
        self.overflow = true;
        self
    }

    pub fn write_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.log.clone()
    }
}

#[async_trait::async_trait]
impl MTKPort for ScriptedPort {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(Error::io("Scripted write failure"));
        }
        self.log.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    async fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.overflow {
            return Err(TransportError::Overflow.into());
        }
        if self.rx.is_empty() {
            return Err(TransportError::ReadTimeout { expected: buf.len(), got: 0 }.into());
        }

        let n = buf.len().min(self.rx.len()).min(self.fragment.unwrap_or(usize::MAX));
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn pending(&mut self) -> Result<usize> {
        Ok(self.rx.len())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn set_baudrate(&mut self, _: u32) -> Result<()> {
        Ok(())
    }

    async fn ctrl_out(&mut self, _: u8, _: u8, _: u16, _: u16, _: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn ctrl_in(&mut self, _: u8, _: u8, _: u16, _: u16, len: usize) -> Result<Vec<u8>> {
        Ok(vec![0; len])
    }

    fn get_connection_type(&self) -> ConnectionType {
        ConnectionType::Brom
    }

    fn get_baudrate(&self) -> u32 {
        0
    }

    fn get_port_name(&self) -> String {
        "SCRIPTED".to_string()
    }
}

/// Loop-back port: every written byte comes straight back.
#[derive(Debug, Default)]
pub struct EchoPort {
    rx: VecDeque<u8>,
}

#[async_trait::async_trait]
impl MTKPort for EchoPort {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.rx.extend(buf);
        Ok(buf.len())
    }

    async fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.rx.is_empty() {
            return Err(TransportError::ReadTimeout { expected: buf.len(), got: 0 }.into());
        }
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn pending(&mut self) -> Result<usize> {
        Ok(self.rx.len())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn set_baudrate(&mut self, _: u32) -> Result<()> {
        Ok(())
    }

    async fn ctrl_out(&mut self, _: u8, _: u8, _: u16, _: u16, _: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn ctrl_in(&mut self, _: u8, _: u8, _: u16, _: u16, len: usize) -> Result<Vec<u8>> {
        Ok(vec![0; len])
    }

    fn get_connection_type(&self) -> ConnectionType {
        ConnectionType::Brom
    }

    fn get_baudrate(&self) -> u32 {
        0
    }

    fn get_port_name(&self) -> String {
        "ECHO".to_string()
    }
}
