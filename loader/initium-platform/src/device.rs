//! Boot device identity, as reported to the kernel in the BOOTDEV record.

use alloc::string::String;

/// The boot network device is configured for IPv6.
pub const NET_IPV6: u32 = 1 << 0;

/// Addressing state of a network boot device. IPv4 addresses occupy the
/// first four bytes of their field.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetInfo {
    pub flags: u32,
    pub server_port: u32,
    pub hw_type: u8,
    pub hw_addr_size: u8,
    pub server_ip: [u8; 16],
    pub gateway_ip: [u8; 16],
    pub client_ip: [u8; 16],
    pub client_mac: [u8; 16],
}

/// What the system was booted from.
#[derive(Debug, Clone)]
pub enum BootDevice {
    /// A mounted filesystem identified by UUID.
    Filesystem { uuid: String },
    /// A network boot.
    Network(NetInfo),
    /// A free-form specifier the loader does not interpret.
    Other(String),
    /// Nothing usable identified.
    None,
}
