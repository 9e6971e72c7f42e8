//! Device identity derived from the hardware unique identifier.
//!
//! Both values are sent as transport headers at connect time
//! (`x-device-id`, `x-device-token`).

/// Stable device identifier pair derived from the 6-byte MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_token: String,
}

/// XOR masks applied to the reversed MAC bytes, alternating per byte.
const TOKEN_MASKS: [u8; 2] = [0xA5, 0x5A];

fn hex_upper(bytes: impl Iterator<Item = u8>) -> String {
    bytes.map(|b| format!("{b:02X}")).collect()
}

impl DeviceIdentity {
    /// Derive the identity from the hardware MAC.
    ///
    /// `device_id` is `hitony-` followed by the MAC as 12 uppercase hex
    /// characters. `device_token` is the MAC reversed, each byte XOR-masked
    /// with 0xA5/0x5A alternating, as 12 uppercase hex characters.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let device_id = format!("hitony-{}", hex_upper(mac.iter().copied()));
        let device_token = hex_upper(
            mac.iter()
                .rev()
                .enumerate()
                .map(|(i, b)| b ^ TOKEN_MASKS[i % 2]),
        );

        Self {
            device_id,
            device_token,
        }
    }
}
