/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use nusb::descriptors::TransferType;
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, Direction, In, Out, Recipient};
use nusb::{DeviceInfo, Interface};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::connection::port::{
    ConnectionType,
    DeviceAddress,
    MTKPort,
    PortKind,
    connection_type_for,
};
use crate::error::{Error, Result, TransportError};

const MAX_TIMEOUT: Duration = Duration::from_secs(2);
const CTRL_TIMEOUT: Duration = Duration::from_secs(1);
const PENDING_POLL: Duration = Duration::from_millis(1);
const BULK_IN_SZ: usize = 0x80000;
const BULK_OUT_SZ: usize = 0x80000;

pub struct UsbMTKPort {
    info: DeviceInfo,
    interface: Option<Interface>,
    ctrl_interface: Option<Interface>,
    reader: Option<EndpointRead<Bulk>>,
    writer: Option<EndpointWrite<Bulk>>,
    ep_out: u8,
    ep_in: u8,
    connection_type: ConnectionType,
    is_open: bool,
}

impl fmt::Debug for UsbMTKPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UsbMTKPort {{ info: {:?}, connection_type: {:?}, is_open: {} }}",
            self.info, self.connection_type, self.is_open
        )
    }
}

fn location(info: &DeviceInfo) -> String {
    format!("usb:{}-{:03}", info.bus_id(), info.device_address())
}

fn split_request_type(request_type: u8) -> (ControlType, Recipient) {
    let control_type = match (request_type >> 5) & 0b11 {
        1 => ControlType::Class,
        2 => ControlType::Vendor,
        _ => ControlType::Standard,
    };

    let recipient = match request_type & 0b11111 {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        _ => Recipient::Other,
    };

    (control_type, recipient)
}

impl UsbMTKPort {
    pub fn new(info: DeviceInfo, connection_type: ConnectionType) -> Self {
        Self {
            info,
            interface: None,
            ctrl_interface: None,
            writer: None,
            reader: None,
            ep_out: 0,
            ep_in: 0,
            connection_type,
            is_open: false,
        }
    }

    pub async fn detect() -> Result<Vec<DeviceAddress>> {
        let devices = nusb::list_devices().await?;

        Ok(devices
            .filter_map(|device| {
                let connection_type =
                    connection_type_for(device.vendor_id(), device.product_id())?;
                Some(DeviceAddress {
                    location: location(&device),
                    kind: PortKind::Usb,
                    vid: device.vendor_id(),
                    pid: device.product_id(),
                    connection_type,
                })
            })
            .collect())
    }

    pub async fn from_address(address: &DeviceAddress) -> Result<Self> {
        let mut devices = nusb::list_devices().await?;

        devices
            .find(|d| location(d) == address.location)
            .map(|info| UsbMTKPort::new(info, address.connection_type))
            .ok_or_else(|| Error::conn(format!("Device at {} is gone", address.location)))
    }

    fn select_endpoints(&mut self, iface: &Interface) -> Result<()> {
        for alt in iface.descriptors() {
            let mut in_ep = None;
            let mut out_ep = None;

            for ep in alt.endpoints() {
                if !matches!(ep.transfer_type(), TransferType::Bulk) {
                    continue;
                }

                match ep.direction() {
                    Direction::In => in_ep = Some(ep.address()),
                    Direction::Out => out_ep = Some(ep.address()),
                }
            }

            if let (Some(i), Some(o)) = (in_ep, out_ep) {
                self.ep_in = i;
                self.ep_out = o;
                return Ok(());
            }
        }

        Err(Error::io("No bulk endpoints found"))
    }

    async fn setup_cdc(&self) -> Result<()> {
        let iface = self.ctrl_interface.as_ref().ok_or(Error::io("Interface not open"))?;

        const CDC_INTERFACE_NUM: u16 = 0;
        const SET_LINE_CODING: u8 = 0x20;
        const SET_CONTROL_LINE_STATE: u8 = 0x22;
        // 115200 baud, 1 stop bit, no parity, 8 data bits
        const LINE_CODING: [u8; 7] = [0x00, 0xC2, 0x01, 0x00, 0x00, 0x00, 0x08];
        const CONTROL_LINE_STATE: u16 = 0x03; // DTR | RTS

        iface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: SET_LINE_CODING,
                    value: 0,
                    index: CDC_INTERFACE_NUM,
                    data: &LINE_CODING,
                },
                MAX_TIMEOUT,
            )
            .await
            .map_err(|e| Error::io(format!("CDC Set Line Coding failed: {}", e)))?;

        iface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: SET_CONTROL_LINE_STATE,
                    value: CONTROL_LINE_STATE,
                    index: CDC_INTERFACE_NUM,
                    data: &[],
                },
                MAX_TIMEOUT,
            )
            .await
            .map_err(|e| Error::io(format!("CDC Set Control Line State failed: {}", e)))?;

        debug!("CDC Setup complete");
        Ok(())
    }
}

#[async_trait]
impl MTKPort for UsbMTKPort {
    async fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Ok(());
        }

        let device = self.info.open().await?;
        let ctrl_iface = device.detach_and_claim_interface(0).await?;
        let iface = device.detach_and_claim_interface(1).await?;

        self.select_endpoints(&iface)?;

        // Seem to be a windows bug
        #[cfg(windows)]
        let tr = 1;

        #[cfg(not(windows))]
        let tr = 8;

        let ep_in = iface.endpoint::<Bulk, In>(self.ep_in)?;
        let rdr = ep_in.reader(BULK_IN_SZ).with_num_transfers(tr).with_read_timeout(MAX_TIMEOUT);
        let ep_out = iface.endpoint::<Bulk, Out>(self.ep_out)?;
        let wr = ep_out.writer(BULK_OUT_SZ).with_num_transfers(tr).with_write_timeout(MAX_TIMEOUT);

        self.reader = Some(rdr);
        self.writer = Some(wr);
        self.interface = Some(iface);
        self.ctrl_interface = Some(ctrl_iface);

        // BootROM speaks raw bulk, CDC is only needed past it
        if self.connection_type != ConnectionType::Brom
            && let Err(e) = self.setup_cdc().await
        {
            debug!("CDC setup failed (may be ok): {:?}", e);
        }

        self.is_open = true;

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Ok(());
        }

        // NUSB automatically releases interfaces on drop
        self.reader = None;
        self.writer = None;
        self.interface = None;
        self.ctrl_interface = None;
        self.is_open = false;

        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let writer = self.writer.as_mut().ok_or_else(|| Error::io("USB port is not open"))?;

        writer.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn read(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize> {
        let reader = self.reader.as_mut().ok_or_else(|| Error::io("USB port is not open"))?;

        match timeout(wait, reader.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                Err(TransportError::Overflow.into())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::ReadTimeout { expected: buf.len(), got: 0 }.into()),
        }
    }

    async fn pending(&mut self) -> Result<usize> {
        let reader = self.reader.as_mut().ok_or_else(|| Error::io("USB port is not open"))?;

        match timeout(PENDING_POLL, reader.fill_buf()).await {
            Ok(Ok(buffered)) => Ok(buffered.len()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(0),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| Error::io("USB port is not open"))?;
        writer.flush().await?;
        Ok(())
    }

    /// Bulk endpoints have no line rate
    async fn set_baudrate(&mut self, _baudrate: u32) -> Result<()> {
        Ok(())
    }

    async fn ctrl_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<()> {
        let iface =
            self.ctrl_interface.as_ref().ok_or_else(|| Error::io("USB port is not open"))?;
        let (control_type, recipient) = split_request_type(request_type);

        iface
            .control_out(
                ControlOut { control_type, recipient, request, value, index, data },
                CTRL_TIMEOUT,
            )
            .await
            .map_err(|e| Error::io(format!("Control OUT transfer failed: {}", e)))?;

        Ok(())
    }

    async fn ctrl_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
    ) -> Result<Vec<u8>> {
        let iface =
            self.ctrl_interface.as_ref().ok_or_else(|| Error::io("USB port is not open"))?;
        let (control_type, recipient) = split_request_type(request_type);

        let buf = iface
            .control_in(
                ControlIn { control_type, recipient, request, value, index, length: len as u16 },
                CTRL_TIMEOUT,
            )
            .await
            .map_err(|e| Error::io(format!("Control IN transfer failed: {}", e)))?;

        Ok(buf)
    }

    fn get_connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    fn get_baudrate(&self) -> u32 {
        0
    }

    fn get_port_name(&self) -> String {
        format!("USB {:04X}:{:04X}", self.info.vendor_id(), self.info.product_id())
    }
}
