/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

/// Single-byte BootROM opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Read32 = 0xD1,
    ChangeBaud = 0xD2,
    Write32 = 0xD4,
    GetTargetConfig = 0xD8,
    /// Kamakiri entry, reuses the SLA challenge opcode.
    SendPayload = 0xE0,
    GetMeId = 0xE1,
    GetSocId = 0xE7,
    GetHwSwVer = 0xFC,
    GetHwCode = 0xFD,
}

pub const HANDSHAKE_START: u8 = 0xA0;
pub const HANDSHAKE_SEQ: [u8; 4] = [HANDSHAKE_START, 0x0A, 0x50, 0x05];

pub const ACK: u8 = 0x5A;
pub const NACK: u8 = 0xA5;

/// Byte sent repeatedly after switching rates, until the line settles.
pub const BAUD_SYNC: u8 = 0xC0;
pub const BAUD_CHANGE_ARGS: [u8; 2] = [0x02, 0x01];
pub const ESCALATED_BAUDRATE: u32 = 460_800;
