//! Native constants mirrored from the Linux Bluetooth headers, trimmed to what
//! [`Address`](crate::Address) and [`AddressType`](crate::AddressType) need.

#[repr(packed)]
#[repr(C)]
#[derive(Clone)]
pub struct bdaddr_t {
    pub b: [u8; 6],
}

pub const BDADDR_BREDR: u8 = 0x00;
pub const BDADDR_LE_PUBLIC: u8 = 0x01;
pub const BDADDR_LE_RANDOM: u8 = 0x02;
